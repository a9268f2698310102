//! Run command implementation.
//!
//! Builds an orchestrator from the configuration, registers the novel workers
//! over the offline echo generator with results persisted to the data
//! directory, and runs one workflow to a terminal status.

use anyhow::{Context, bail};
use colored::Colorize;
use quill_abstraction::{DocumentStore, Parameters};
use quill_core::{EchoGenerator, JsonFileStore, QuillConfig, register_novel_workers};
use quill_orchestrator::{WorkflowResults, WorkflowStatus};
use serde_json::Value;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Options of `quill run`.
#[derive(Debug)]
pub struct RunOptions {
    pub template: String,
    pub project: String,
    pub params: Vec<(String, Value)>,
    pub timeout_secs: u64,
    pub json: bool,
}

/// Parses `key=value`. Values that are valid JSON are kept as JSON, anything else is a string.
pub fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(format!("expected key=value, got '{raw}'"));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Execute the run command. Exits with failure when the workflow does not complete.
pub async fn execute(config: &QuillConfig, options: RunOptions) -> anyhow::Result<ExitCode> {
    let orchestrator = config.orchestrator().await.context("Failed to build orchestrator")?;
    if orchestrator.catalog().get(&options.template).await.is_none() {
        bail!("Unknown workflow template '{}'", options.template);
    }

    let store: Arc<dyn DocumentStore> = Arc::new(JsonFileStore::new(&config.storage.data_dir));
    register_novel_workers(orchestrator.registry(), Arc::new(EchoGenerator::default()), Some(store)).await;

    let parameters: Parameters = options.params.into_iter().collect();
    info!(template = %options.template, project = %options.project, "Running workflow");

    orchestrator.start_scheduler().await?;
    let outcome = orchestrator
        .run(&options.template, &options.project, parameters, Duration::from_secs(options.timeout_secs))
        .await;
    orchestrator.shutdown().await?;
    let results = outcome.with_context(|| format!("Workflow '{}' did not finish", options.template))?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_summary(&results, config, &options.project);
    }

    Ok(if results.status == WorkflowStatus::Completed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn print_summary(results: &WorkflowResults, config: &QuillConfig, project: &str) {
    let status = match results.status {
        WorkflowStatus::Completed => results.status.to_string().green(),
        _ => results.status.to_string().red(),
    };
    println!("Workflow {} {} ({:.0}%)", results.workflow_id, status, results.progress);

    for step in &results.completed_steps {
        let elapsed = results.step_durations_ms.get(step).copied().unwrap_or_default();
        println!("  {} {step} ({elapsed} ms)", "✓".green());
    }
    for step in &results.failed_steps {
        println!("  {} {step}", "✗".red());
    }
    for step in &results.blocked_steps {
        println!("  {} {step} (blocked)", "·".dimmed());
    }
    for error in &results.error_log {
        let kind = if error.terminal { "failed" } else { "retried" };
        println!("  {} attempt {} {kind}: {}", error.step_id, error.attempt, error.message);
    }

    println!("Documents stored in {}", config.storage.data_dir.join("projects").join(project).display());
}
