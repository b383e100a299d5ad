//! Weave - declarative agent workflows
//!
//! Main entry point for the weave CLI.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use weave_config::{LoggingSection, WeaveConfig};

mod client;
mod commands;

use commands::{list, run, validate};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Weave - run declarative agent workflows
#[derive(Parser)]
#[command(name = "weave")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file to use instead of the discovered layers
    #[arg(long, global = true, env = "WEAVE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate workflow files
    Validate(validate::ValidateArgs),

    /// List workflows in the workflow directory
    List(list::ListArgs),

    /// Run a workflow and follow it to completion
    Run(run::RunArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, warnings) = load_config(cli.config.as_deref())?;
    let _guard = init_tracing(&config.logging(), cli.verbose);
    for warning in warnings {
        warn!("{}", warning);
    }

    let ctx = commands::Context {
        config,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Validate(args) => validate::run(args, &ctx).await,
        Commands::List(args) => list::run(args, &ctx).await,
        Commands::Run(args) => run::run(args, &ctx).await,
    }
}

fn load_config(explicit: Option<&Path>) -> Result<(WeaveConfig, Vec<String>)> {
    match explicit {
        Some(path) => {
            let config = weave_config::load_config_file(path)
                .with_context(|| format!("loading config {}", path.display()))?;
            config.validate()?;
            Ok((config, Vec::new()))
        }
        None => {
            let loaded = weave_config::load_config(None)?;
            Ok((loaded.config, loaded.warnings))
        }
    }
}

/// Console (human-readable, stderr) plus a daily rolling file.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing(
    logging: &LoggingSection,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let console_filter = if verbose {
        "weave=debug,weave_workflow=debug,weave_config=debug,info".to_string()
    } else {
        "weave=warn,weave_workflow=warn,weave_config=warn,error".to_string()
    };
    let level = logging.level.to_ascii_lowercase();
    let file_filter = format!(
        "weave={level},weave_workflow={level},weave_config={level},warn"
    );

    let log_dir = logging
        .directory
        .clone()
        .or_else(|| weave_config::xdg_config_dir().map(|d| d.join("logs")))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let appender = std::fs::create_dir_all(&log_dir)
        .ok()
        .and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("weave")
                .filename_suffix("log")
                .build(&log_dir)
                .ok()
        });
    let (writer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let json_file = writer.clone().filter(|_| logging.json).map(|writer| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(EnvFilter::new(&file_filter))
    });
    let plain_file = writer.filter(|_| !logging.json).map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(EnvFilter::new(&file_filter))
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(console_filter)),
                ),
        )
        .with(json_file)
        .with(plain_file)
        .init();

    guard
}
