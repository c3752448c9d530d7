//! Pre-built specifications and settings for consistent testing.

use crate::config::ProjectConfig;
use crate::spec::{Endpoint, Entity, Field, Specification};
use std::path::Path;

/// A single-entity order service with its two collection endpoints.
#[must_use]
pub fn order_specification() -> Specification {
    Specification {
        name: "order-service".to_string(),
        description: "Tracks customer orders".to_string(),
        entities: vec![Entity {
            name: "Order".to_string(),
            fields: vec![
                Field {
                    name: "id".to_string(),
                    field_type: "string".to_string(),
                    required: true,
                },
                Field {
                    name: "customer".to_string(),
                    field_type: "string".to_string(),
                    required: true,
                },
                Field {
                    name: "total".to_string(),
                    field_type: "number".to_string(),
                    required: false,
                },
            ],
        }],
        endpoints: vec![
            Endpoint::new("GET", "/api/v1/orders").for_entity("Order"),
            Endpoint::new("POST", "/api/v1/orders").for_entity("Order"),
        ],
        instructions: None,
        must_have: Vec::new(),
    }
}

/// Settings that need no external tools.
#[must_use]
pub fn test_config() -> ProjectConfig {
    let mut config = ProjectConfig::default();
    config.service.required_tools = Vec::new();
    config.service.startup_timeout_secs = 1;
    config
}

/// Write `content` as the generated service's entry point under `root`.
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn write_source_tree(root: &Path, content: &str) {
    let src = root.join("src");
    std::fs::create_dir_all(&src).expect("Failed to create src directory");
    std::fs::write(src.join("server.js"), content).expect("Failed to write server.js");
}
