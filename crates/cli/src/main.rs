//! `scriptforge` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`  — statically validate a script file.
//! - `run`       — execute a script file in the sandbox.
//! - `templates` — list the registered script templates.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use nodes::{ScriptEngine, ScriptMetadata};
use sandbox::geometry::NullGeometry;
use sandbox::policy::Policy;
use sandbox::validator::Severity;

#[derive(Parser)]
#[command(
    name = "scriptforge",
    about = "Sandboxed script nodes for node-graph CAD",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a script file without executing it.
    Validate {
        /// Path to the script file.
        path: PathBuf,
    },
    /// Compile and execute a script file in the sandbox.
    Run {
        /// Path to the script file.
        path: PathBuf,
        /// Input values as a JSON object.
        #[arg(long, default_value = "{}")]
        inputs: String,
        /// Parameter values as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,
        /// Execution timeout in milliseconds.
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
        /// Memory ceiling in megabytes.
        #[arg(long, default_value_t = 64)]
        memory_mb: u32,
        /// Grant the script access to the geometry API.
        #[arg(long)]
        allow_geometry: bool,
    },
    /// List the registered script templates.
    Templates {
        /// Only show templates in this category.
        #[arg(long)]
        category: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let engine = ScriptEngine::new(Arc::new(NullGeometry));

    match cli.command {
        Command::Validate { path } => {
            let script = read_script(&path)?;
            let report = engine.validate(&script);

            for diagnostic in report.errors.iter().chain(&report.warnings) {
                let label = match diagnostic.severity {
                    Severity::Error => "error",
                    Severity::Warning => "warning",
                };
                println!(
                    "{label}[{}] {}:{} {}",
                    diagnostic.code, diagnostic.line, diagnostic.column, diagnostic.message
                );
            }
            if report.valid {
                println!("✅ Script is valid");
            } else {
                eprintln!("❌ Validation failed with {} error(s)", report.errors.len());
                std::process::exit(1);
            }
        }
        Command::Run {
            path,
            inputs,
            params,
            timeout_ms,
            memory_mb,
            allow_geometry,
        } => {
            let script = read_script(&path)?;
            let inputs: Value =
                serde_json::from_str(&inputs).context("--inputs is not valid JSON")?;
            let params: Value =
                serde_json::from_str(&params).context("--params is not valid JSON")?;

            let policy = Policy {
                timeout_ms,
                memory_limit_mb: memory_mb,
                allow_geometry_api: allow_geometry,
                ..Policy::default()
            };
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("script")
                .to_string();
            let node = engine
                .compile_node(&script, ScriptMetadata::new(&name), policy)
                .with_context(|| format!("cannot compile {}", path.display()))?;

            let result = node.run(inputs, params).await;

            for entry in &result.logs {
                eprintln!("[{:?}] {}", entry.level, entry.message);
            }
            match result.error {
                None => {
                    println!("{}", serde_json::to_string_pretty(&Value::Object(result.outputs))?);
                    for metric in &result.metrics {
                        eprintln!("{} = {}", metric.name, metric.value);
                    }
                    eprintln!(
                        "✅ Completed in {}ms ({} bytes)",
                        result.execution_time_ms, result.memory_used_bytes
                    );
                }
                Some(err) => {
                    eprintln!("❌ Execution failed: {err}");
                    std::process::exit(1);
                }
            }
        }
        Command::Templates { category } => {
            let templates = engine.templates().templates(category.as_deref());
            if templates.is_empty() {
                println!("No templates registered");
                return Ok(());
            }
            for template in templates {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "name": template.name,
                        "category": template.category,
                        "description": template.description,
                        "placeholders": template.placeholders,
                    }))?
                );
            }
        }
    }

    Ok(())
}

fn read_script(path: &PathBuf) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("cannot read file {}", path.display()))
}
