//! Quill CLI - command-line interface for the Quill workflow engine.
//!
//! Provides a `quill` command that lists workflow templates, runs a workflow
//! end to end with the offline echo generator, and inspects the documents the
//! workers stored.

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quill_core::{QuillConfig, init_logging};
use std::path::PathBuf;
use std::process::ExitCode;

use commands::run::RunOptions;

/// Quill - workflow orchestration for long-form writing
#[derive(Parser, Debug)]
#[command(name = "quill", author, version, about = "Quill - workflow orchestration for long-form writing")]
struct Args {
    /// Log level or filter directive (overrides the configured level)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List workflow templates with their steps and dependencies
    Templates {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a workflow to completion and persist every step result
    Run {
        /// Template name
        #[arg(short, long)]
        template: String,

        /// Project the workflow works on
        #[arg(short, long)]
        project: String,

        /// Run parameter as key=value (repeatable); JSON values are passed as JSON
        #[arg(long = "param", value_parser = commands::run::parse_param)]
        params: Vec<(String, serde_json::Value)>,

        /// Data directory (overrides storage.data_dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Seconds to wait for the workflow to finish
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a stored document, or list a project's documents
    Show {
        /// Project id
        #[arg(short, long)]
        project: String,

        /// Document kind (step id); lists kinds when omitted
        #[arg(short, long)]
        kind: Option<String>,

        /// Data directory (overrides storage.data_dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let mut config = QuillConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging.level, config.logging.json).context("Failed to initialize logging")?;

    match args.command {
        Command::Templates { json } => commands::templates::execute(&config, json).await?,
        Command::Run { template, project, params, data_dir, timeout_secs, json } => {
            if let Some(dir) = data_dir {
                config.storage.data_dir = dir;
            }
            let options = RunOptions { template, project, params, timeout_secs, json };
            return commands::run::execute(&config, options).await;
        }
        Command::Show { project, kind, data_dir } => {
            if let Some(dir) = data_dir {
                config.storage.data_dir = dir;
            }
            commands::show::execute(&config, &project, kind.as_deref()).await?;
        }
        Command::Config => commands::config::execute(&config)?,
    }

    Ok(ExitCode::SUCCESS)
}
