//! Source-code view.
//!
//! Detection is textual. The [`SourceCodeProbe`] trait keeps the
//! reconciler independent of how the view is produced.

use crate::error::Result;
use crate::spec::{entity_names_match, Endpoint};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

const SOURCE_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "ts", "jsx", "tsx"];
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "dist", "build", "coverage"];

/// What the generated source declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceView {
    pub files_scanned: usize,
    /// Entity-like names from storage and type declarations.
    pub entities: BTreeSet<String>,
    pub endpoints: Vec<Endpoint>,
}

impl SourceView {
    #[must_use]
    pub fn has_entity(&self, name: &str) -> bool {
        self.entities.iter().any(|e| entity_names_match(e, name))
    }

    #[must_use]
    pub fn has_endpoint(&self, endpoint: &Endpoint) -> bool {
        let key = endpoint.key();
        self.endpoints.iter().any(|e| e.key() == key)
    }

    fn add_endpoint(&mut self, endpoint: Endpoint) {
        if !self.has_endpoint(&endpoint) {
            self.endpoints.push(endpoint);
        }
    }
}

/// Produces a [`SourceView`] for a generated tree.
pub trait SourceCodeProbe: Send + Sync {
    /// Scan everything below `root`. A missing root is an empty view.
    fn scan(&self, root: &Path) -> Result<SourceView>;
}

/// Regex-based scanner for JavaScript/TypeScript services.
#[derive(Debug)]
pub struct RegexSourceProbe {
    routes: Vec<Regex>,
    storage: Vec<Regex>,
    types: Vec<Regex>,
}

impl Default for RegexSourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl RegexSourceProbe {
    #[must_use]
    pub fn new() -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
        };
        Self {
            routes: compile(&[
                r#"\b(?:app|router)\.(get|post|put|patch|delete)\(\s*['"`]([^'"`]+)['"`]"#,
            ]),
            storage: compile(&[r"\b(\w+?)Store\s*=\s*new\s+Map\b", r"\b(\w+?)Repository\b"]),
            types: compile(&[
                r"\bclass\s+(\w+)",
                r"\binterface\s+(\w+)",
                r"\btype\s+(\w+)\s*=",
                r"@typedef\s*\{[^}]*\}\s*(\w+)",
            ]),
        }
    }

    fn scan_text(&self, text: &str, view: &mut SourceView) {
        for regex in &self.routes {
            for caps in regex.captures_iter(text) {
                view.add_endpoint(Endpoint::new(&caps[1], &caps[2]));
            }
        }
        for regex in self.storage.iter().chain(self.types.iter()) {
            for caps in regex.captures_iter(text) {
                view.entities.insert(caps[1].to_string());
            }
        }
    }
}

fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

impl SourceCodeProbe for RegexSourceProbe {
    fn scan(&self, root: &Path) -> Result<SourceView> {
        let mut view = SourceView::default();
        if !root.is_dir() {
            return Ok(view);
        }

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            !(entry.depth() > 0
                && entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIPPED_DIRS.contains(&name)))
        });

        for entry in walker.filter_map(std::result::Result::ok) {
            if !entry.file_type().is_file() || !is_source_file(entry.path()) {
                continue;
            }
            match std::fs::read_to_string(entry.path()) {
                Ok(text) => {
                    view.files_scanned += 1;
                    self.scan_text(&text, &mut view);
                }
                Err(e) => debug!("Skipping unreadable {}: {}", entry.path().display(), e),
            }
        }

        debug!(
            "Source scan: {} files, {} entities, {} endpoints",
            view.files_scanned,
            view.entities.len(),
            view.endpoints.len()
        );
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{self, fallback::FallbackGenerator};
    use crate::testing::fixtures::order_specification;
    use tempfile::TempDir;

    #[test]
    fn test_scan_detects_routes_and_entities() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        std::fs::write(
            temp.path().join("src/server.js"),
            "const ordersStore = new Map();\napp.get('/api/v1/orders', h);\nrouter.post(\"/api/v1/orders/\", h);\nclass Customer {}\n",
        )
        .unwrap();

        let view = RegexSourceProbe::new().scan(temp.path()).unwrap();
        assert_eq!(view.files_scanned, 1);
        assert!(view.has_entity("Order"));
        assert!(view.has_entity("customer"));
        assert!(view.has_endpoint(&Endpoint::new("GET", "/api/v1/orders")));
        assert!(view.has_endpoint(&Endpoint::new("POST", "/api/v1/orders")));
        assert!(!view.has_endpoint(&Endpoint::new("DELETE", "/api/v1/orders")));
    }

    #[test]
    fn test_scan_skips_dependencies_and_other_files() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("node_modules/x")).unwrap();
        std::fs::write(
            temp.path().join("node_modules/x/index.js"),
            "app.get('/leak', h);",
        )
        .unwrap();
        std::fs::write(temp.path().join("notes.md"), "app.get('/doc', h);").unwrap();

        let view = RegexSourceProbe::new().scan(temp.path()).unwrap();
        assert_eq!(view.files_scanned, 0);
        assert!(view.endpoints.is_empty());
    }

    #[test]
    fn test_missing_root_is_empty_view() {
        let temp = TempDir::new().unwrap();
        let view = RegexSourceProbe::new()
            .scan(&temp.path().join("absent"))
            .unwrap();
        assert_eq!(view, SourceView::default());
    }

    #[test]
    fn test_fallback_output_is_fully_detected() {
        let temp = TempDir::new().unwrap();
        let spec = order_specification();
        let generator = FallbackGenerator::new(3000, "/health");
        artifact::persist(temp.path(), &generator.artifacts(&spec), "test").unwrap();

        let view = RegexSourceProbe::new().scan(temp.path()).unwrap();
        for endpoint in spec.planned_endpoints("/health") {
            assert!(view.has_endpoint(&endpoint), "missing {endpoint}");
        }
        assert!(view.has_entity("Order"));
    }
}
