//! Closed set of remediation actions.
//!
//! Every fix the cascade can apply, whether it comes from the heuristic
//! table, a registry replay or an oracle descriptor, is one of these typed
//! variants. Replaying a stored fix is a dispatch over this enum, never the
//! execution of generated text.

use crate::artifact::fallback::{FallbackGenerator, MANIFEST_PATH};
use crate::artifact::{self, sanitize_relative, ChangeAction, FileChange};
use crate::spec::Specification;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

const TSCONFIG_PATH: &str = "tsconfig.json";

/// A typed remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemediationAction {
    /// Declare a missing package in the manifest.
    AddDependency {
        name: String,
        #[serde(default = "default_version")]
        version: String,
    },
    /// Terminate whatever holds the port.
    FreePort { port: u16 },
    /// Turn off strict compiler options.
    RelaxCompilerConfig,
    /// Create a directory below the output root.
    CreateDirectory { path: String },
    /// Write a whole file.
    WriteFile { path: String, content: String },
    /// Replace text in an existing file.
    ReplaceInFile {
        path: String,
        find: String,
        replace: String,
    },
    /// Regenerate files with the fallback generator.
    RegenerateArtifacts { paths: Vec<String> },
}

fn default_version() -> String {
    "latest".to_string()
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddDependency { name, version } => {
                write!(f, "add dependency {name}@{version}")
            }
            Self::FreePort { port } => write!(f, "free port {port}"),
            Self::RelaxCompilerConfig => write!(f, "relax compiler strictness"),
            Self::CreateDirectory { path } => write!(f, "create directory {path}"),
            Self::WriteFile { path, .. } => write!(f, "write {path}"),
            Self::ReplaceInFile { path, .. } => write!(f, "patch {path}"),
            Self::RegenerateArtifacts { paths } => {
                write!(f, "regenerate {}", paths.join(", "))
            }
        }
    }
}

/// What an action may touch.
#[derive(Debug, Clone, Copy)]
pub struct RemediationContext<'a> {
    pub output_root: &'a Path,
    pub spec: &'a Specification,
    pub fallback: &'a FallbackGenerator,
}

impl RemediationAction {
    /// Apply the action and report the files it changed.
    ///
    /// An action that would leave everything as it was is an error, so the
    /// cascade never reports a fix that changed nothing.
    pub async fn apply(&self, ctx: &RemediationContext<'_>) -> Result<Vec<FileChange>> {
        let reason = self.to_string();
        match self {
            Self::AddDependency { name, version } => {
                add_dependency(ctx.output_root, name, version, &reason).map(|c| vec![c])
            }
            Self::FreePort { port } => {
                free_port(*port).await?;
                Ok(Vec::new())
            }
            Self::RelaxCompilerConfig => relax_compiler_config(ctx.output_root, &reason),
            Self::CreateDirectory { path } => {
                let clean = sanitize_relative(path)?;
                let target = ctx.output_root.join(&clean);
                if target.is_dir() {
                    bail!("directory {} already exists", clean.display());
                }
                std::fs::create_dir_all(&target)
                    .with_context(|| format!("Failed to create {}", target.display()))?;
                Ok(vec![FileChange::new(
                    clean.to_string_lossy(),
                    ChangeAction::Created,
                    reason,
                )])
            }
            Self::WriteFile { path, content } => {
                let change =
                    artifact::write_file(ctx.output_root, Path::new(path), content, &reason)?;
                if !change.is_effective() {
                    bail!("{path} already has the requested content");
                }
                Ok(vec![change])
            }
            Self::ReplaceInFile {
                path,
                find,
                replace,
            } => {
                let clean = sanitize_relative(path)?;
                let target = ctx.output_root.join(&clean);
                let existing = std::fs::read_to_string(&target)
                    .with_context(|| format!("Failed to read {}", clean.display()))?;
                if find.is_empty() || !existing.contains(find.as_str()) {
                    bail!("text to replace not found in {}", clean.display());
                }
                let updated = existing.replace(find.as_str(), replace);
                let change = artifact::write_file(ctx.output_root, &clean, &updated, &reason)?;
                Ok(vec![change])
            }
            Self::RegenerateArtifacts { paths } => {
                let artifacts = ctx.fallback.artifacts_named(ctx.spec, paths);
                if artifacts.is_empty() {
                    bail!("no fallback template for {}", paths.join(", "));
                }
                Ok(artifact::persist(ctx.output_root, &artifacts, &reason)?)
            }
        }
    }
}

fn add_dependency(root: &Path, name: &str, version: &str, reason: &str) -> Result<FileChange> {
    let path = root.join(MANIFEST_PATH);
    let content = std::fs::read_to_string(&path).context("No package.json to add a dependency to")?;
    let mut manifest: Value =
        serde_json::from_str(&content).context("package.json is not valid JSON")?;
    let Some(object) = manifest.as_object_mut() else {
        bail!("package.json is not an object");
    };

    let deps = object
        .entry("dependencies")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let Some(deps) = deps.as_object_mut() else {
        bail!("package.json dependencies is not an object");
    };
    if deps.contains_key(name) {
        bail!("{name} is already declared");
    }
    deps.insert(name.to_string(), Value::String(version.to_string()));

    let rendered = serde_json::to_string_pretty(&manifest)? + "\n";
    Ok(artifact::write_file(
        root,
        Path::new(MANIFEST_PATH),
        &rendered,
        reason,
    )?)
}

fn relax_compiler_config(root: &Path, reason: &str) -> Result<Vec<FileChange>> {
    let path = root.join(TSCONFIG_PATH);
    let content = std::fs::read_to_string(&path).context("No tsconfig.json to relax")?;
    let mut config: Value =
        serde_json::from_str(&content).context("tsconfig.json is not valid JSON")?;
    let Some(object) = config.as_object_mut() else {
        bail!("tsconfig.json is not an object");
    };
    let options = object
        .entry("compilerOptions")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    let Some(options) = options.as_object_mut() else {
        bail!("compilerOptions is not an object");
    };
    for key in ["strict", "noImplicitAny", "strictNullChecks"] {
        options.insert(key.to_string(), Value::Bool(false));
    }

    let rendered = serde_json::to_string_pretty(&config)? + "\n";
    let change = artifact::write_file(root, Path::new(TSCONFIG_PATH), &rendered, reason)?;
    if !change.is_effective() {
        bail!("compiler config is already relaxed");
    }
    Ok(vec![change])
}

async fn free_port(port: u16) -> Result<()> {
    let lsof = which::which("lsof").context("lsof is not available to free the port")?;
    let output = AsyncCommand::new(lsof)
        .arg("-ti")
        .arg(format!("tcp:{port}"))
        .output()
        .await
        .context("Failed to run lsof")?;
    let own = std::process::id();
    let pids: Vec<u32> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .filter(|pid| *pid != own)
        .collect();
    if pids.is_empty() {
        bail!("no process is listening on port {port}");
    }

    let kill = which::which("kill").context("kill is not available")?;
    for pid in pids {
        debug!("Killing pid {} holding port {}", pid, port);
        let status = AsyncCommand::new(&kill)
            .arg("-9")
            .arg(pid.to_string())
            .status()
            .await
            .context("Failed to run kill")?;
        if !status.success() {
            bail!("kill {pid} failed");
        }
    }
    info!("Freed port {}", port);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::order_specification;
    use tempfile::TempDir;

    fn apply_in(
        root: &Path,
        action: &RemediationAction,
    ) -> Result<Vec<FileChange>> {
        let spec = order_specification();
        let fallback = FallbackGenerator::new(3000, "/health");
        let ctx = RemediationContext {
            output_root: root,
            spec: &spec,
            fallback: &fallback,
        };
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(action.apply(&ctx))
    }

    #[test]
    fn test_descriptor_serde_is_tagged() {
        let json = r#"{"kind":"add_dependency","name":"express"}"#;
        let action: RemediationAction = serde_json::from_str(json).unwrap();
        assert_eq!(
            action,
            RemediationAction::AddDependency {
                name: "express".to_string(),
                version: "latest".to_string()
            }
        );
        let back = serde_json::to_value(&RemediationAction::RelaxCompilerConfig).unwrap();
        assert_eq!(back["kind"], "relax_compiler_config");
    }

    #[test]
    fn test_add_dependency_updates_manifest_once() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("package.json"), r#"{"name":"x"}"#).unwrap();
        let action = RemediationAction::AddDependency {
            name: "cors".to_string(),
            version: "^2.8.5".to_string(),
        };

        let changes = apply_in(temp.path(), &action).unwrap();
        assert_eq!(changes[0].action, ChangeAction::Modified);
        let raw = std::fs::read_to_string(temp.path().join("package.json")).unwrap();
        let manifest: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(manifest["dependencies"]["cors"], "^2.8.5");

        // Already declared: nothing to fix.
        assert!(apply_in(temp.path(), &action).is_err());
    }

    #[test]
    fn test_create_directory_stays_inside_root() {
        let temp = TempDir::new().unwrap();
        let action = RemediationAction::CreateDirectory {
            path: "data/cache".to_string(),
        };
        apply_in(temp.path(), &action).unwrap();
        assert!(temp.path().join("data/cache").is_dir());
        assert!(apply_in(temp.path(), &action).is_err());

        let escape = RemediationAction::CreateDirectory {
            path: "../outside".to_string(),
        };
        assert!(apply_in(temp.path(), &escape).is_err());
    }

    #[test]
    fn test_replace_in_file_requires_match() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.js"), "const port = 80;\n").unwrap();
        let action = RemediationAction::ReplaceInFile {
            path: "a.js".to_string(),
            find: "80".to_string(),
            replace: "3000".to_string(),
        };
        apply_in(temp.path(), &action).unwrap();
        assert_eq!(
            std::fs::read_to_string(temp.path().join("a.js")).unwrap(),
            "const port = 3000;\n"
        );
        assert!(apply_in(temp.path(), &action).is_err());
    }

    #[test]
    fn test_relax_compiler_config() {
        let temp = TempDir::new().unwrap();
        assert!(apply_in(temp.path(), &RemediationAction::RelaxCompilerConfig).is_err());

        std::fs::write(
            temp.path().join("tsconfig.json"),
            r#"{"compilerOptions":{"strict":true}}"#,
        )
        .unwrap();
        apply_in(temp.path(), &RemediationAction::RelaxCompilerConfig).unwrap();
        let raw = std::fs::read_to_string(temp.path().join("tsconfig.json")).unwrap();
        let config: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(config["compilerOptions"]["strict"], false);
    }

    #[test]
    fn test_regenerate_artifacts_uses_fallback() {
        let temp = TempDir::new().unwrap();
        let action = RemediationAction::RegenerateArtifacts {
            paths: vec!["src/server.js".to_string()],
        };
        let changes = apply_in(temp.path(), &action).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(temp.path().join("src/server.js").is_file());

        let unknown = RemediationAction::RegenerateArtifacts {
            paths: vec!["nope.txt".to_string()],
        };
        assert!(apply_in(temp.path(), &unknown).is_err());
    }

    #[test]
    fn test_write_file_noop_is_not_a_fix() {
        let temp = TempDir::new().unwrap();
        let action = RemediationAction::WriteFile {
            path: "config/app.json".to_string(),
            content: "{}".to_string(),
        };
        apply_in(temp.path(), &action).unwrap();
        assert!(apply_in(temp.path(), &action).is_err());
    }
}
