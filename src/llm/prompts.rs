//! Prompt construction for generation and fix requests.

use crate::artifact::REQUIRED_FILES;
use crate::config::OracleConfig;
use crate::llm::OracleRequest;
use crate::spec::Specification;

const GENERATION_SYSTEM_PROMPT: &str = "You are a senior backend engineer. \
Produce a complete, runnable Node.js (Express) service. \
Return ONLY fenced code blocks. Tag every block with its relative file path \
using the form ```<lang> path=<relative/path>. Do not use absolute paths or '..'.";

const FIX_SYSTEM_PROMPT: &str = "You repair failing build and runtime steps. \
Answer with a single JSON object and nothing else.";

/// Schema of the remediation descriptor the fix prompt asks for.
pub const FIX_DESCRIPTOR_SCHEMA: &str = r#"{
  "action": {
    "kind": "add_dependency" | "free_port" | "relax_compiler_config" | "create_directory"
          | "write_file" | "replace_in_file" | "regenerate_artifacts",
    ...typed parameters for the kind:
      add_dependency: {"name": str, "version": str}
      free_port: {"port": int}
      create_directory: {"path": str}
      write_file: {"path": str, "content": str}
      replace_in_file: {"path": str, "find": str, "replace": str}
      regenerate_artifacts: {"paths": [str]}
  },
  "confidence": number between 0 and 1,
  "reusable": bool,
  "explanation": str
}"#;

/// Cut `text` to at most `max_chars`, keeping the tail (where errors live).
#[must_use]
pub fn truncate_context(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skip = count - max_chars;
    let tail: String = text.chars().skip(skip).collect();
    format!("[...{skip} chars truncated...]\n{tail}")
}

/// Request for the primary artifact generation.
#[must_use]
pub fn generation_request(
    spec: &Specification,
    port: u16,
    health_path: &str,
    config: &OracleConfig,
) -> OracleRequest {
    let spec_json = serde_json::to_string_pretty(spec).unwrap_or_else(|_| spec.name.clone());
    let mut user = format!(
        "Generate the service described by this specification.\n\n```json\n{spec_json}\n```\n\n"
    );
    user.push_str(&format!(
        "Requirements:\n- Listen on process.env.PORT or {port}.\n- Expose GET {health_path} returning {{\"status\":\"ok\"}}.\n"
    ));
    user.push_str(
        "- Implement every endpoint listed (or the REST endpoints implied by each entity).\n",
    );
    user.push_str("- Keep data in memory.\n");
    user.push_str(&format!(
        "- Required files: {}.\n",
        REQUIRED_FILES.join(", ")
    ));
    if let Some(instructions) = &spec.instructions {
        user.push_str(&format!("\nAdditional instructions:\n{instructions}\n"));
    }
    OracleRequest::new(
        GENERATION_SYSTEM_PROMPT,
        user,
        config.temperature,
        config.max_tokens,
    )
}

/// Request asking the oracle for a structured remediation descriptor.
#[must_use]
pub fn fix_request(
    task_id: &str,
    error: &str,
    context: &str,
    config: &OracleConfig,
) -> OracleRequest {
    let context = truncate_context(context, config.context_chars);
    let user = format!(
        "Task `{task_id}` failed.\n\nError:\n{error}\n\nContext:\n{context}\n\n\
Respond with one JSON object of this shape:\n{FIX_DESCRIPTOR_SCHEMA}\n\n\
Set \"reusable\" to true only if the same fix applies whenever this exact error recurs."
    );
    OracleRequest::new(FIX_SYSTEM_PROMPT, user, 0.0, config.max_tokens.min(2000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::order_specification;

    #[test]
    fn test_truncate_context_keeps_tail() {
        let text = "a".repeat(10) + "ERROR";
        let out = truncate_context(&text, 5);
        assert!(out.ends_with("ERROR"));
        assert!(out.contains("10 chars truncated"));
        assert_eq!(truncate_context("short", 100), "short");
    }

    #[test]
    fn test_generation_request_mentions_contract() {
        let req = generation_request(
            &order_specification(),
            3000,
            "/health",
            &OracleConfig::default(),
        );
        assert!(req.user_prompt.contains("\"Order\""));
        assert!(req.user_prompt.contains("GET /health"));
        assert!(req.user_prompt.contains("src/server.js"));
        assert!(req.system_prompt.contains("path="));
        assert_eq!(req.max_tokens, 8000);
    }

    #[test]
    fn test_fix_request_truncates_context() {
        let config = OracleConfig {
            context_chars: 10,
            ..OracleConfig::default()
        };
        let req = fix_request("start-service", "boom", &"x".repeat(50), &config);
        assert!(req.user_prompt.contains("start-service"));
        assert!(req.user_prompt.contains("40 chars truncated"));
        assert!(req.user_prompt.contains("\"confidence\""));
        assert!(req.max_tokens <= 2000);
    }
}
