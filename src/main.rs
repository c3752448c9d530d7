//! Autoforge - specification-driven service generation

use autoforge::audit::EvolutionLog;
use autoforge::config::ProjectConfig;
use autoforge::llm::{ClaudeCliOracle, CodeOracle};
use autoforge::r#loop::{LoopPhase, OrchestrationLoop, RunMode};
use autoforge::reconcile::{Severity, StateReconciler};
use autoforge::snapshot::SnapshotStore;
use autoforge::spec::Specification;
use autoforge::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Exit status when the iteration budget ran out with tasks unfinished.
const EXIT_PARTIAL_FAILURE: i32 = 3;
/// Exit status when reconciliation found error-severity drift.
const EXIT_NOT_RECONCILED: i32 = 4;

#[derive(Parser)]
#[command(name = "autoforge")]
#[command(version)]
#[command(
    about = "Generate, run and reconcile a service from its specification",
    long_about = None
)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration loop for a specification
    Run {
        /// Specification file (JSON)
        #[arg(short, long)]
        spec: PathBuf,

        /// Maximum passes over the plan (overrides settings)
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Generation mode
        #[arg(long, value_enum, default_value = "oracle")]
        mode: RunMode,

        /// Leave the generated service running after the run
        #[arg(long)]
        keep_running: bool,
    },

    /// Reconcile specification, source, live service and logs once
    Analyze {
        /// Specification file (JSON)
        #[arg(short, long)]
        spec: PathBuf,

        /// Print the full state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the last snapshot
    Status {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// List evolution cycles
    Audit {
        /// Verify the hash chain instead of listing
        #[arg(long)]
        verify: bool,
    },

    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "autoforge=debug,info"
    } else {
        "autoforge=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    match execute(cli.command, &project_path).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(e.exit_code());
        }
    }
}

fn load_config(project_path: &Path) -> Result<ProjectConfig> {
    let config = ProjectConfig::load(project_path)?;
    config.validate()?;
    Ok(config)
}

async fn execute(command: Commands, project_path: &Path) -> Result<i32> {
    match command {
        Commands::Run {
            spec,
            max_iterations,
            mode,
            keep_running,
        } => {
            let mut config = load_config(project_path)?;
            if let Some(n) = max_iterations {
                config.loop_config.max_iterations = n;
            }
            if keep_running {
                config.service.keep_running = true;
            }
            config.validate()?;
            // Structural problems surface through the validate-plan task.
            let spec = Specification::load(&resolve(project_path, &spec))?;

            let oracle: Option<Arc<dyn CodeOracle>> = match mode {
                RunMode::Oracle => {
                    let cli_oracle = ClaudeCliOracle::new(project_path, &config.oracle);
                    if cli_oracle.is_available() {
                        Some(Arc::new(cli_oracle))
                    } else {
                        warn!(
                            "Oracle command '{}' not found, generating from templates",
                            config.oracle.command
                        );
                        None
                    }
                }
                RunMode::Offline => None,
            };

            println!(
                "{} {} ({} mode)",
                "Autoforge:".cyan().bold(),
                spec.name,
                mode
            );
            let mut run = OrchestrationLoop::standard(project_path, spec, config, mode, oracle)?;
            let report = run.run().await?;

            println!();
            match report.outcome {
                LoopPhase::Success => println!(
                    "{} all tasks done in {} iteration(s)",
                    "✓ Success:".green().bold(),
                    report.iterations
                ),
                _ => {
                    println!(
                        "{} {} task(s) unfinished after {} iteration(s)",
                        "✗ Partial failure:".yellow().bold(),
                        report.remaining.len(),
                        report.iterations
                    );
                    for id in &report.remaining {
                        println!("   - {id}");
                    }
                }
            }
            if let Some(state) = &report.reconciliation {
                let summary = state.summary();
                println!(
                    "   Reconciled: {} ({} errors, {} warnings)",
                    summary.reconciled, summary.errors, summary.warnings
                );
            }
            Ok(if report.is_success() { 0 } else { EXIT_PARTIAL_FAILURE })
        }

        Commands::Analyze { spec, json } => {
            let config = load_config(project_path)?;
            let spec = Specification::load(&resolve(project_path, &spec))?;
            let reconciler = StateReconciler::new(spec, config.output_root(project_path), &config)?;
            let state = reconciler.analyze().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                let summary = state.summary();
                println!(
                    "{} {} errors, {} warnings, {} info",
                    "Reconciliation:".cyan().bold(),
                    summary.errors,
                    summary.warnings,
                    summary.infos
                );
                for d in reconciler.reconciliation_plan(&state) {
                    let line = d.to_string();
                    let line = match d.severity {
                        Severity::Error => line.red(),
                        Severity::Warning => line.yellow(),
                        Severity::Info => line.normal(),
                    };
                    println!("   {line}");
                    println!("     -> {}", d.suggestion);
                }
                if state.reconciled {
                    println!("{}", "✓ Reconciled".green().bold());
                } else {
                    println!("{}", "✗ Not reconciled".red().bold());
                }
            }
            Ok(if state.reconciled { 0 } else { EXIT_NOT_RECONCILED })
        }

        Commands::Status { json } => {
            let config = load_config(project_path)?;
            let store = SnapshotStore::new(config.state_root(project_path));
            let Some(snapshot) = store.load()? else {
                println!("No snapshot found at {}", store.snapshot_path().display());
                return Ok(0);
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                return Ok(0);
            }
            println!(
                "{} {} run {} ({} mode)",
                "Status:".cyan().bold(),
                snapshot.specification.name,
                snapshot.run_id,
                snapshot.mode
            );
            println!("   Phase: {} (iteration {})", snapshot.phase, snapshot.iteration);
            println!(
                "   Service: port {} in {}",
                snapshot.service.port, snapshot.service.output_dir
            );
            println!("{}", "─".repeat(40));
            for task in &snapshot.tasks {
                let duration = task
                    .duration_sec
                    .map(|d| format!(" ({d:.1}s)"))
                    .unwrap_or_default();
                println!("   {:<9} {}{}", task.status.to_string(), task.id, duration);
                if let Some(error) = &task.error {
                    println!("             {}", error.lines().next().unwrap_or_default().dimmed());
                }
            }
            if let Some(summary) = snapshot.reconciliation {
                println!(
                    "   Reconciled: {} ({} errors, {} warnings)",
                    summary.reconciled, summary.errors, summary.warnings
                );
            }
            Ok(0)
        }

        Commands::Audit { verify } => {
            let config = load_config(project_path)?;
            let log = EvolutionLog::new(config.state_root(project_path));
            if verify {
                let result = log.verify()?;
                if result.is_valid {
                    println!(
                        "{} {} cycles verified",
                        "✓ Audit log valid:".green().bold(),
                        result.cycles_verified
                    );
                    return Ok(0);
                }
                println!(
                    "{} cycle {}: {}",
                    "✗ Audit log invalid:".red().bold(),
                    result.first_invalid.unwrap_or_default(),
                    result.error_description.unwrap_or_default()
                );
                return Ok(1);
            }

            let cycles = log.read_cycles()?;
            println!("{} {} cycles", "Evolution log:".cyan().bold(), cycles.len());
            for cycle in cycles {
                println!(
                    "   #{:<3} {} {:<13} {} ({} changes)",
                    cycle.sequence,
                    cycle.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    cycle.trigger.to_string(),
                    cycle.detail,
                    cycle.changes.len()
                );
            }
            Ok(0)
        }

        Commands::Config => {
            let config = ProjectConfig::load(project_path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(0)
        }
    }
}

/// Relative specification paths are resolved against the project directory.
fn resolve(project_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() || path.exists() {
        path.to_path_buf()
    } else {
        project_path.join(path)
    }
}
