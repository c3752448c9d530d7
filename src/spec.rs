//! Declarative specification model.
//!
//! A [`Specification`] lists the entities and endpoints the generated
//! service must provide. When no endpoints are declared, REST endpoints are
//! derived per entity. The derived [`Specification::planned_endpoints`] view
//! always contains the health endpoint.

use crate::error::{AutoforgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// HTTP methods a specification may declare.
pub const KNOWN_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

/// Prefix used for derived entity endpoints.
pub const API_PREFIX: &str = "/api/v1";

/// Declarative description of the service to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Specification {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub entities: Vec<Entity>,

    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    /// Free-form generation instructions passed to the oracle.
    #[serde(default)]
    pub instructions: Option<String>,

    /// Secondary targets: `"METHOD /path"` or a relative file path.
    #[serde(default)]
    pub must_have: Vec<String>,
}

/// A domain entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,

    #[serde(default)]
    pub fields: Vec<Field>,
}

/// A field of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,

    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: String,

    #[serde(default)]
    pub required: bool,
}

fn default_field_type() -> String {
    "string".to_string()
}

/// An HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: String,
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
}

impl Endpoint {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            entity: None,
        }
    }

    #[must_use]
    pub fn for_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Whether the path contains a parameter segment (`:id` or `{id}`).
    #[must_use]
    pub fn is_parameterized(&self) -> bool {
        is_parameterized_path(&self.path)
    }

    /// Method and path normalised for comparison across views.
    #[must_use]
    pub fn key(&self) -> (String, String) {
        (self.method.to_ascii_uppercase(), normalize_path(&self.path))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Whether any path segment is a parameter.
#[must_use]
pub fn is_parameterized_path(path: &str) -> bool {
    path.split('/')
        .any(|seg| seg.starts_with(':') || (seg.starts_with('{') && seg.ends_with('}')))
}

/// Trim trailing slashes so `/orders/` and `/orders` compare equal.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Lower-case plural used for collection routes and stores.
#[must_use]
pub fn plural_of(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with('s') {
        lower
    } else if let Some(stem) = lower.strip_suffix('y') {
        if stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            format!("{lower}s")
        } else {
            format!("{stem}ies")
        }
    } else {
        format!("{lower}s")
    }
}

/// URL segment for an entity collection, e.g. `Line Item` -> `line-items`.
#[must_use]
pub fn collection_segment(entity: &str) -> String {
    plural_of(entity)
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Case-insensitive, singular/plural tolerant entity name match.
///
/// Separators are ignored, so `Line Item`, `line-items` and `lineItems` agree.
#[must_use]
pub fn entity_names_match(a: &str, b: &str) -> bool {
    let compact = |name: &str| -> String {
        name.chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_ascii_lowercase()
    };
    let a = compact(a);
    let b = compact(b);
    a == b || plural_of(&a) == b || plural_of(&b) == a || plural_of(&a) == plural_of(&b)
}

impl Specification {
    /// Load a specification from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AutoforgeError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a specification from JSON text.
    pub fn from_json(content: &str) -> Result<Self> {
        let mut spec: Self = serde_json::from_str(content)
            .map_err(|e| AutoforgeError::specification(format!("invalid specification: {e}")))?;
        for endpoint in &mut spec.endpoints {
            endpoint.method = endpoint.method.to_ascii_uppercase();
        }
        Ok(spec)
    }

    /// Entity names in declaration order.
    #[must_use]
    pub fn entity_names(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.name.clone()).collect()
    }

    /// Collection route for an entity, e.g. `/api/v1/orders`.
    #[must_use]
    pub fn collection_path(entity: &str) -> String {
        format!("{API_PREFIX}/{}", collection_segment(entity))
    }

    /// Declared endpoints, or derived REST endpoints when none are declared.
    #[must_use]
    pub fn declared_or_derived_endpoints(&self) -> Vec<Endpoint> {
        if !self.endpoints.is_empty() {
            return self.endpoints.clone();
        }
        let mut endpoints = Vec::new();
        for entity in &self.entities {
            let collection = Self::collection_path(&entity.name);
            let item = format!("{collection}/:id");
            endpoints.push(Endpoint::new("GET", &collection).for_entity(&entity.name));
            endpoints.push(Endpoint::new("POST", &collection).for_entity(&entity.name));
            endpoints.push(Endpoint::new("GET", &item).for_entity(&entity.name));
            endpoints.push(Endpoint::new("PUT", &item).for_entity(&entity.name));
            endpoints.push(Endpoint::new("DELETE", &item).for_entity(&entity.name));
        }
        endpoints
    }

    /// Every endpoint the service is expected to expose, health included.
    #[must_use]
    pub fn planned_endpoints(&self, health_path: &str) -> Vec<Endpoint> {
        let mut endpoints = self.declared_or_derived_endpoints();
        let health = Endpoint::new("GET", health_path);
        if !endpoints.iter().any(|e| e.key() == health.key()) {
            endpoints.insert(0, health);
        }
        endpoints
    }

    /// Endpoints that belong to an entity, by explicit tag or path match.
    #[must_use]
    pub fn endpoints_for(&self, entity: &str) -> Vec<Endpoint> {
        let plural = plural_of(entity);
        let segment = collection_segment(entity);
        self.declared_or_derived_endpoints()
            .into_iter()
            .filter(|e| match &e.entity {
                Some(tag) => entity_names_match(tag, entity),
                None => e.path.split('/').any(|seg| {
                    seg.eq_ignore_ascii_case(&plural) || seg.eq_ignore_ascii_case(&segment)
                }),
            })
            .collect()
    }

    /// Plan-vs-specification validation.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("specification name is empty".to_string());
        }
        if self.entities.is_empty() {
            problems.push("specification declares no entities".to_string());
        }

        let mut seen = HashSet::new();
        for entity in &self.entities {
            if entity.name.trim().is_empty() {
                problems.push("entity with empty name".to_string());
            } else if !seen.insert(entity.name.to_ascii_lowercase()) {
                problems.push(format!("duplicate entity '{}'", entity.name));
            }
        }

        for endpoint in &self.endpoints {
            if !KNOWN_METHODS.contains(&endpoint.method.to_ascii_uppercase().as_str()) {
                problems.push(format!("unknown HTTP method in '{endpoint}'"));
            }
            if !endpoint.path.starts_with('/') {
                problems.push(format!("path must start with '/' in '{endpoint}'"));
            }
        }

        for entity in &self.entities {
            if self.endpoints_for(&entity.name).is_empty() {
                problems.push(format!("entity '{}' has no planned endpoint", entity.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AutoforgeError::specification(problems.join("; ")))
        }
    }

    /// Parsed `mustHave` entries.
    #[must_use]
    pub fn must_have_targets(&self) -> Vec<MustHave> {
        self.must_have.iter().map(|s| MustHave::parse(s)).collect()
    }
}

/// A secondary target every run must satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MustHave {
    /// An endpoint that must be registered in source code.
    Endpoint(Endpoint),
    /// A file that must exist under the output root.
    File(String),
}

impl MustHave {
    /// `"GET /orders"` parses as an endpoint, anything else as a file.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some((method, path)) = raw.split_once(char::is_whitespace) {
            let method = method.to_ascii_uppercase();
            let path = path.trim();
            if KNOWN_METHODS.contains(&method.as_str()) && path.starts_with('/') {
                return Self::Endpoint(Endpoint::new(method, path));
            }
        }
        Self::File(raw.to_string())
    }
}

impl fmt::Display for MustHave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Endpoint(e) => write!(f, "{e}"),
            Self::File(p) => write!(f, "{p}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_spec() -> Specification {
        Specification::from_json(
            r#"{
                "name": "shop",
                "entities": [{"name": "Order", "fields": [{"name": "total", "type": "number"}]}],
                "endpoints": [
                    {"method": "GET", "path": "/api/v1/orders"},
                    {"method": "post", "path": "/api/v1/orders"}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_plural_of() {
        assert_eq!(plural_of("Order"), "orders");
        assert_eq!(plural_of("Category"), "categories");
        assert_eq!(plural_of("Key"), "keys");
        assert_eq!(plural_of("Status"), "status");
    }

    #[test]
    fn test_entity_names_match() {
        assert!(entity_names_match("Order", "orders"));
        assert!(entity_names_match("category", "Categories"));
        assert!(!entity_names_match("Order", "Customer"));
        assert!(entity_names_match("Line Item", "lineitems"));
        assert!(entity_names_match("line-item", "Line Item"));
        assert_eq!(collection_segment("Line Item"), "line-items");
    }

    #[test]
    fn test_is_parameterized() {
        assert!(is_parameterized_path("/api/v1/orders/:id"));
        assert!(is_parameterized_path("/api/v1/orders/{id}"));
        assert!(!is_parameterized_path("/api/v1/orders"));
    }

    #[test]
    fn test_planned_endpoints_include_health() {
        let spec = order_spec();
        let planned = spec.planned_endpoints("/health");
        assert_eq!(planned.len(), 3);
        assert_eq!(planned[0].to_string(), "GET /health");
        assert_eq!(planned[2].method, "POST");
    }

    #[test]
    fn test_derived_endpoints() {
        let spec = Specification::from_json(
            r#"{"name": "blog", "entities": [{"name": "Post"}]}"#,
        )
        .unwrap();
        let endpoints = spec.declared_or_derived_endpoints();
        assert_eq!(endpoints.len(), 5);
        assert!(endpoints
            .iter()
            .any(|e| e.method == "DELETE" && e.path == "/api/v1/posts/:id"));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let spec = Specification::from_json(
            r#"{
                "name": "",
                "entities": [{"name": "A"}, {"name": "a"}],
                "endpoints": [{"method": "FETCH", "path": "nope"}]
            }"#,
        )
        .unwrap();
        let err = spec.validate().unwrap_err().to_string();
        assert!(err.contains("name is empty"));
        assert!(err.contains("duplicate entity"));
        assert!(err.contains("unknown HTTP method"));
        assert!(err.contains("must start with '/'"));
        assert!(err.contains("no planned endpoint"));
    }

    #[test]
    fn test_must_have_parse() {
        assert_eq!(
            MustHave::parse("get /api/v1/orders"),
            MustHave::Endpoint(Endpoint::new("GET", "/api/v1/orders"))
        );
        assert_eq!(
            MustHave::parse("README.md"),
            MustHave::File("README.md".to_string())
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = Specification::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, AutoforgeError::MissingFile { .. }));
    }
}
