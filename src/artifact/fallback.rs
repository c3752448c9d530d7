//! Deterministic, template-based artifact generation.
//!
//! The fallback generator derives a runnable Express service purely from the
//! [`Specification`]. It never calls the oracle, so a run always has a way
//! forward when the oracle is unreachable or its output is unusable.

use super::{parse_fenced_blocks, render_fenced_blocks, Artifact};
use crate::error::Result;
use crate::spec::{plural_of, Endpoint, Specification};
use std::collections::BTreeSet;
use std::path::Path;

pub const MANIFEST_PATH: &str = "package.json";
pub const SERVER_PATH: &str = "src/server.js";
pub const TESTS_PATH: &str = "tests/api.test.js";
pub const README_PATH: &str = "README.md";

/// Every file the fallback generator can produce.
pub const FALLBACK_FILES: &[&str] = &[MANIFEST_PATH, SERVER_PATH, TESTS_PATH, README_PATH];

/// Template-based generator.
#[derive(Debug, Clone)]
pub struct FallbackGenerator {
    port: u16,
    health_path: String,
}

impl FallbackGenerator {
    #[must_use]
    pub fn new(port: u16, health_path: impl Into<String>) -> Self {
        Self {
            port,
            health_path: health_path.into(),
        }
    }

    /// Full output in the oracle's fenced-block convention.
    #[must_use]
    pub fn generate(&self, spec: &Specification) -> String {
        render_fenced_blocks(&self.artifacts(spec))
    }

    /// Parse [`Self::generate`] back into artifacts, exercising the same
    /// parser oracle output goes through.
    pub fn generate_artifacts(&self, spec: &Specification) -> Result<Vec<Artifact>> {
        parse_fenced_blocks(&self.generate(spec))
    }

    /// Every fallback artifact.
    #[must_use]
    pub fn artifacts(&self, spec: &Specification) -> Vec<Artifact> {
        vec![
            Artifact::new(MANIFEST_PATH, self.manifest(spec)),
            Artifact::new(SERVER_PATH, self.server(spec)),
            Artifact::new(TESTS_PATH, self.tests(spec)),
            Artifact::new(README_PATH, self.readme(spec)),
        ]
    }

    /// Only the named artifacts. Unknown names are skipped.
    #[must_use]
    pub fn artifacts_named(&self, spec: &Specification, paths: &[String]) -> Vec<Artifact> {
        self.artifacts(spec)
            .into_iter()
            .filter(|a| paths.iter().any(|p| Path::new(p) == a.path))
            .collect()
    }

    fn manifest(&self, spec: &Specification) -> String {
        let manifest = serde_json::json!({
            "name": package_name(&spec.name),
            "version": "0.1.0",
            "private": true,
            "description": spec.description,
            "main": SERVER_PATH,
            "scripts": {
                "start": format!("node {SERVER_PATH}"),
                "test": "node --test tests/"
            },
            "dependencies": {
                "express": "^4.19.2"
            }
        });
        serde_json::to_string_pretty(&manifest).unwrap_or_default() + "\n"
    }

    fn server(&self, spec: &Specification) -> String {
        let mut out = String::new();
        out.push_str("'use strict';\n\n");
        out.push_str("const express = require('express');\n\n");
        out.push_str("const app = express();\n");
        out.push_str("app.use(express.json());\n\n");
        out.push_str(&format!(
            "const PORT = Number(process.env.PORT) || {};\n\n",
            self.port
        ));

        for entity in &spec.entities {
            let plural = store_ident(&entity.name);
            let type_name: String = entity
                .name
                .chars()
                .filter(char::is_ascii_alphanumeric)
                .collect();
            out.push_str("/**\n");
            out.push_str(&format!(" * @typedef {{Object}} {type_name}\n"));
            out.push_str(" * @property {number} id\n");
            for field in &entity.fields {
                out.push_str(&format!(
                    " * @property {{{}}} {}\n",
                    field.field_type, field.name
                ));
            }
            out.push_str(" */\n");
            out.push_str(&format!("const {plural}Store = new Map();\n"));
            out.push_str(&format!("let {plural}NextId = 1;\n\n"));
        }

        out.push_str(&format!(
            "app.get('{}', (req, res) => {{\n  res.json({{ status: 'ok', uptime: process.uptime() }});\n}});\n\n",
            self.health_path
        ));

        let mut seen = BTreeSet::new();
        for endpoint in spec.declared_or_derived_endpoints() {
            if endpoint.key().1 == self.health_path || !seen.insert(endpoint.key()) {
                continue;
            }
            out.push_str(&self.route(spec, &endpoint));
        }

        out.push_str("app.use((err, req, res, next) => {\n");
        out.push_str("  console.error(`[${new Date().toISOString()}] error: ${err.message}`);\n");
        out.push_str("  res.status(500).json({ error: 'internal error' });\n");
        out.push_str("});\n\n");
        out.push_str("if (require.main === module) {\n");
        out.push_str("  app.listen(PORT, () => {\n");
        out.push_str(
            "    console.log(`[${new Date().toISOString()}] info: listening on port ${PORT}`);\n",
        );
        out.push_str("  });\n}\n\nmodule.exports = app;\n");
        out
    }

    fn route(&self, spec: &Specification, endpoint: &Endpoint) -> String {
        let method = endpoint.method.to_ascii_lowercase();
        let store = endpoint_store(spec, endpoint);
        let (path, param) = express_path(&endpoint.path);
        let param = param.unwrap_or_else(|| "id".to_string());
        let body = match (store, endpoint.method.as_str(), endpoint.is_parameterized()) {
            (Some(plural), "GET", false) => {
                format!("  res.json(Array.from({plural}Store.values()));")
            }
            (Some(plural), "POST", false) => format!(
                "  const item = {{ ...req.body, id: {plural}NextId++ }};\n  {plural}Store.set(item.id, item);\n  res.status(201).json(item);"
            ),
            (Some(plural), "GET", true) => format!(
                "  const item = {plural}Store.get(Number(req.params.{param}));\n  if (!item) return res.status(404).json({{ error: 'not found' }});\n  res.json(item);"
            ),
            (Some(plural), "PUT" | "PATCH", true) => format!(
                "  const id = Number(req.params.{param});\n  if (!{plural}Store.has(id)) return res.status(404).json({{ error: 'not found' }});\n  const item = {{ ...{plural}Store.get(id), ...req.body, id }};\n  {plural}Store.set(id, item);\n  res.json(item);"
            ),
            (Some(plural), "DELETE", true) => format!(
                "  const removed = {plural}Store.delete(Number(req.params.{param}));\n  res.status(removed ? 204 : 404).end();"
            ),
            _ => "  res.status(501).json({ error: 'not implemented' });".to_string(),
        };
        format!("app.{method}('{path}', (req, res) => {{\n{body}\n}});\n\n")
    }

    fn tests(&self, spec: &Specification) -> String {
        let mut out = String::new();
        out.push_str("'use strict';\n\n");
        out.push_str("const test = require('node:test');\n");
        out.push_str("const assert = require('node:assert');\n\n");
        out.push_str(&format!(
            "const BASE = process.env.BASE_URL || 'http://127.0.0.1:{}';\n\n",
            self.port
        ));
        out.push_str(&format!(
            "test('GET {0} responds', async () => {{\n  const res = await fetch(BASE + '{0}');\n  assert.strictEqual(res.status, 200);\n}});\n",
            self.health_path
        ));
        let mut seen = BTreeSet::new();
        for endpoint in spec.declared_or_derived_endpoints() {
            if endpoint.method != "GET"
                || endpoint.is_parameterized()
                || endpoint.key().1 == self.health_path
                || !seen.insert(endpoint.key())
            {
                continue;
            }
            out.push_str(&format!(
                "\ntest('GET {0} responds', async () => {{\n  const res = await fetch(BASE + '{0}');\n  assert.ok(res.ok, `status ${{res.status}}`);\n}});\n",
                endpoint.path
            ));
        }
        out
    }

    fn readme(&self, spec: &Specification) -> String {
        let mut out = format!("# {}\n\n", spec.name);
        if !spec.description.is_empty() {
            out.push_str(&spec.description);
            out.push_str("\n\n");
        }
        out.push_str("## Running\n\n");
        out.push_str(&format!(
            "    npm install\n    npm start   # listens on port {}\n    npm test\n\n",
            self.port
        ));
        out.push_str("## Entities\n\n");
        for entity in &spec.entities {
            out.push_str(&format!("- **{}**", entity.name));
            if !entity.fields.is_empty() {
                let fields: Vec<String> = entity
                    .fields
                    .iter()
                    .map(|f| format!("{}: {}", f.name, f.field_type))
                    .collect();
                out.push_str(&format!(" ({})", fields.join(", ")));
            }
            out.push('\n');
        }
        out.push_str("\n## Endpoints\n\n");
        for endpoint in spec.planned_endpoints(&self.health_path) {
            out.push_str(&format!("- `{endpoint}`\n"));
        }
        out
    }
}

/// The entity store an endpoint operates on, if any.
fn endpoint_store(spec: &Specification, endpoint: &Endpoint) -> Option<String> {
    spec.entities
        .iter()
        .find(|entity| {
            spec.endpoints_for(&entity.name)
                .iter()
                .any(|e| e.key() == endpoint.key())
        })
        .map(|entity| store_ident(&entity.name))
}

/// Identifier prefix of an entity's in-memory store, e.g. `Line Item` -> `lineitems`.
fn store_ident(entity: &str) -> String {
    let ident: String = plural_of(entity)
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    match ident.chars().next() {
        None => "items".to_string(),
        Some(c) if c.is_ascii_digit() => format!("_{ident}"),
        Some(_) => ident,
    }
}

/// Express form of a route path: `{param}` segments become `:param`.
/// Also returns the last parameter name.
fn express_path(path: &str) -> (String, Option<String>) {
    let mut last = None;
    let mut segments = Vec::new();
    for seg in path.split('/') {
        let name = seg
            .strip_prefix(':')
            .or_else(|| seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')));
        let Some(name) = name else {
            segments.push(seg.to_string());
            continue;
        };
        let mut clean: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if clean.is_empty() {
            clean = "id".to_string();
        } else if clean.starts_with(|c: char| c.is_ascii_digit()) {
            clean.insert(0, 'p');
        }
        segments.push(format!(":{clean}"));
        last = Some(clean);
    }
    (segments.join("/"), last)
}

fn package_name(name: &str) -> String {
    let slug: String = name
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "generated-service".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{missing_required, validate_tree};
    use crate::testing::fixtures::order_specification;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_generates_all_files_through_parser() {
        let generator = FallbackGenerator::new(3000, "/health");
        let artifacts = generator
            .generate_artifacts(&order_specification())
            .unwrap();
        assert_eq!(artifacts.len(), 4);
        assert!(missing_required(&artifacts).is_empty());
    }

    #[test]
    fn test_server_registers_routes_and_store() {
        let generator = FallbackGenerator::new(3000, "/health");
        let server = generator.server(&order_specification());
        assert!(server.contains("app.get('/health'"));
        assert!(server.contains("app.get('/api/v1/orders'"));
        assert!(server.contains("app.post('/api/v1/orders'"));
        assert!(server.contains("const ordersStore = new Map();"));
        assert!(server.contains("@typedef {Object} Order"));
    }

    #[test]
    fn test_manifest_is_json() {
        let generator = FallbackGenerator::new(3000, "/health");
        let manifest = generator.manifest(&order_specification());
        let value: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(value["name"], "order-service");
        assert!(value["dependencies"]["express"].is_string());
    }

    #[test]
    fn test_persisted_tree_validates() {
        let temp = TempDir::new().unwrap();
        let generator = FallbackGenerator::new(3000, "/health");
        let artifacts = generator.artifacts(&order_specification());
        crate::artifact::persist(temp.path(), &artifacts, "fallback").unwrap();
        assert!(validate_tree(temp.path(), "/health").is_ok());
    }

    #[test]
    fn test_artifacts_named_subset() {
        let generator = FallbackGenerator::new(3000, "/health");
        let subset = generator.artifacts_named(
            &order_specification(),
            &["README.md".to_string(), "unknown.txt".to_string()],
        );
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].path, PathBuf::from("README.md"));
    }

    #[test]
    fn test_awkward_names_render_valid_routes_and_survive_parsing() {
        let generator = FallbackGenerator::new(3000, "/health");
        let spec = Specification::from_json(
            r#"{
                "name": "warehouse",
                "description": "Run it with:\n```bash\nnpm start\n```",
                "entities": [{"name": "Line Item"}],
                "endpoints": [
                    {"method": "GET", "path": "/api/v1/line-items", "entity": "Line Item"},
                    {"method": "GET", "path": "/api/v1/line-items/{itemId}", "entity": "Line Item"}
                ]
            }"#,
        )
        .unwrap();

        let artifacts = generator.generate_artifacts(&spec).unwrap();
        assert_eq!(artifacts.len(), FALLBACK_FILES.len());
        let server = &artifacts
            .iter()
            .find(|a| a.path == PathBuf::from(SERVER_PATH))
            .unwrap()
            .content;
        assert!(server.contains("const lineitemsStore = new Map();"));
        assert!(server.contains("app.get('/api/v1/line-items/:itemId'"));
        assert!(server.contains("req.params.itemId"));
        assert!(!server.contains("{itemId}"));

        let readme = &artifacts
            .iter()
            .find(|a| a.path == PathBuf::from(README_PATH))
            .unwrap()
            .content;
        assert!(readme.contains("```bash\nnpm start\n```"));
    }

    #[test]
    fn test_tests_skip_parameterized_routes() {
        let generator = FallbackGenerator::new(3000, "/health");
        let spec = Specification::from_json(
            r#"{"name": "blog", "entities": [{"name": "Post"}]}"#,
        )
        .unwrap();
        let tests = generator.tests(&spec);
        assert!(tests.contains("GET /api/v1/posts responds"));
        assert!(!tests.contains(":id"));
    }

    #[test]
    fn test_package_name() {
        assert_eq!(package_name("My Shop!"), "my-shop");
        assert_eq!(package_name("   "), "generated-service");
    }
}
