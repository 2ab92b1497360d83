//! Runbook command line tool.
//!
//! Runs a workflow definition through a fresh engine with the built-in
//! services registered. Exits 0 when the run reports `ok`, 1 otherwise.

use std::path::{Path, PathBuf};

use anyhow::{Context as AnyhowContext, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

use runbook_engine::{Engine, WorkflowService, WORKFLOW_SERVICE_ID};
use runbook_logwatch::LogValidatorService;

#[derive(Parser)]
#[command(name = "runbookctl")]
#[command(version, about = "Run and validate runbook workflows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow definition
    ///
    /// Examples:
    ///     runbookctl run workflow/regress.yaml
    ///     runbookctl run regress.json --set env=staging --tasks "deploy=0:2"
    ///     runbookctl run suite.yaml --detach --session nightly-7
    #[command(verbatim_doc_comment)]
    Run {
        /// Path to the workflow definition (JSON or YAML)
        file: PathBuf,

        /// Set parameters (format: key=value), can be repeated
        #[arg(long = "set", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Publish parameters into top-level state
        #[arg(long)]
        publish: bool,

        /// Task selector: comma list of `name` or `name=idx1:idx2`
        #[arg(long)]
        tasks: Option<String>,

        /// Launch the workflow in the background and return the session id
        #[arg(long)]
        detach: bool,

        /// Session id; generated when omitted
        #[arg(long)]
        session: Option<String>,

        /// Write per-event JSON files under this directory
        #[arg(long, value_name = "DIR")]
        log_events: Option<PathBuf>,
    },
    /// Parse and validate a workflow definition without running it
    Validate {
        /// Path to the workflow definition (JSON or YAML)
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            params,
            publish,
            tasks,
            detach,
            session,
            log_events,
        } => run_workflow(file, params, publish, tasks, detach, session, log_events).await,
        Commands::Validate { file } => validate_workflow(&file),
    }
}

async fn run_workflow(
    file: PathBuf,
    params: Vec<String>,
    publish: bool,
    tasks: Option<String>,
    detach: bool,
    session: Option<String>,
    log_events: Option<PathBuf>,
) -> Result<()> {
    let engine = Engine::new();
    engine.register_service(WorkflowService::new());
    engine.register_service(LogValidatorService::new());

    let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let context = engine.new_context(&session_id);

    let name = file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .context("workflow file has no name")?;
    let url = file
        .canonicalize()
        .with_context(|| format!("workflow file not found: {}", file.display()))?
        .display()
        .to_string();

    let payload = json!({
        "Name": name,
        "WorkflowURL": url,
        "Params": parse_params(&params)?,
        "PublishParameters": publish,
        "Tasks": tasks.unwrap_or_default(),
        "Async": detach,
        "EnableLogging": log_events.is_some(),
        "LoggingDirectory": log_events.map(|dir| dir.display().to_string()).unwrap_or_default(),
    });

    let service = context.service(WORKFLOW_SERVICE_ID)?;
    let request = service.new_request("run", payload)?;
    let response = service.run(&context, request).await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.is_ok() {
        std::process::exit(1);
    }
    Ok(())
}

fn validate_workflow(file: &Path) -> Result<()> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("failed to read workflow: {}", file.display()))?;
    let workflow = runbook_engine::loader::decode(&file.display().to_string(), &bytes)?;
    workflow.validate()?;
    println!(
        "workflow '{}' is valid: {} task(s)",
        workflow.name,
        workflow.tasks.len()
    );
    Ok(())
}

/// Parse repeated `key=value` flags; values parse as JSON when they can.
fn parse_params(params: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for param in params {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("invalid parameter '{}', expected key=value", param))?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        let params = vec![
            "env=staging".to_string(),
            "count=3".to_string(),
            "flag=true".to_string(),
        ];
        let map = parse_params(&params).unwrap();
        assert_eq!(map["env"], json!("staging"));
        assert_eq!(map["count"], json!(3));
        assert_eq!(map["flag"], json!(true));
    }

    #[test]
    fn test_parse_params_rejects_bare_key() {
        assert!(parse_params(&["oops".to_string()]).is_err());
    }
}
