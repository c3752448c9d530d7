//! Level-4 oracle-assisted fixes.
//!
//! The oracle is asked for a structured descriptor, never for code to run.

use super::remediation::RemediationAction;
use crate::config::OracleConfig;
use crate::error::{AutoforgeError, Result};
use crate::llm::prompts::fix_request;
use crate::llm::CodeOracle;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Structured answer to a fix request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixDescriptor {
    pub action: RemediationAction,
    pub confidence: f64,
    #[serde(default)]
    pub reusable: bool,
    #[serde(default)]
    pub explanation: String,
}

/// Parse a descriptor from oracle text that may wrap the JSON in prose or a fence.
pub fn parse_descriptor(text: &str) -> Result<FixDescriptor> {
    let start = text.find('{');
    let end = text.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(AutoforgeError::malformed("fix descriptor contains no JSON object"));
    };
    if end < start {
        return Err(AutoforgeError::malformed("fix descriptor contains no JSON object"));
    }
    let descriptor: FixDescriptor = serde_json::from_str(&text[start..=end])
        .map_err(|e| AutoforgeError::malformed(format!("invalid fix descriptor: {e}")))?;
    if !(0.0..=1.0).contains(&descriptor.confidence) {
        return Err(AutoforgeError::malformed(format!(
            "fix descriptor confidence {} is outside [0, 1]",
            descriptor.confidence
        )));
    }
    Ok(descriptor)
}

/// Ask the oracle for a descriptor.
pub async fn request_fix(
    oracle: &dyn CodeOracle,
    task_id: &str,
    error: &str,
    context: &str,
    config: &OracleConfig,
) -> Result<FixDescriptor> {
    let request = fix_request(task_id, error, context, config);
    let text = oracle
        .generate(&request)
        .await
        .map_err(|e| AutoforgeError::oracle(e.to_string()))?;
    debug!("Fix descriptor from {}: {} chars", oracle.model_name(), text.len());
    parse_descriptor(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockOracle;

    #[test]
    fn test_parse_fenced_descriptor() {
        let text = "Here you go:\n```json\n{\"action\":{\"kind\":\"free_port\",\"port\":3000},\"confidence\":0.9,\"reusable\":true,\"explanation\":\"stale server\"}\n```";
        let d = parse_descriptor(text).unwrap();
        assert_eq!(d.action, RemediationAction::FreePort { port: 3000 });
        assert!(d.reusable);
        assert!((d.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_descriptor("no json here").is_err());
        assert!(parse_descriptor("{\"action\":{\"kind\":\"rm_rf\"},\"confidence\":1}").is_err());
        assert!(parse_descriptor(
            "{\"action\":{\"kind\":\"relax_compiler_config\"},\"confidence\":7}"
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_request_fix_maps_oracle_failure() {
        let oracle = MockOracle::new().with_error("rate limited");
        let err = request_fix(&oracle, "run-tests", "boom", "", &OracleConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AutoforgeError::Oracle { .. }));
        assert_eq!(oracle.call_count(), 1);
    }
}
