//! Run command - execute a workflow file and follow its progress.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use console::{Style, style};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use weave_workflow::{
    EngineConfig, ExecutionStatus, MockAgentClient, SharedAgentClient, StepStatus,
    WorkflowEngine, WorkflowEvent, WorkflowExecution, load_workflow_file,
};

use super::Context;
use crate::client::HttpAgentClient;

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Workflow TOML file
    pub file: PathBuf,

    /// Workflow parameter as key=value (value parsed as JSON, else string)
    #[arg(short, long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// JSON file whose object seeds the execution context
    #[arg(long)]
    pub context: Option<PathBuf>,

    /// User the execution runs on behalf of
    #[arg(long, default_value = "cli")]
    pub user: String,

    /// Agent registry URL (overrides `agent.base_url`)
    #[arg(long, env = "WEAVE_AGENT_URL")]
    pub agent_url: Option<String>,

    /// Answer every agent call locally by echoing the request
    #[arg(long)]
    pub dry_run: bool,
}

/// Run the run command.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let workflow = load_workflow_file(&args.file)
        .with_context(|| format!("loading {}", args.file.display()))?;
    let parameters = parse_params(&args.params)?;
    let context = match &args.context {
        Some(path) => load_context(path)?,
        None => HashMap::new(),
    };

    let agent_section = ctx.config.agent();
    let agent: SharedAgentClient = if args.dry_run {
        Arc::new(MockAgentClient::new())
    } else {
        let base_url = args.agent_url.unwrap_or(agent_section.base_url);
        Arc::new(HttpAgentClient::new(
            &base_url,
            Duration::from_secs(agent_section.request_timeout_secs),
        )?)
    };

    let engine = WorkflowEngine::new(agent, EngineConfig::from(&ctx.config.engine()));
    let workflow_id = workflow.id.clone();
    engine.register_workflow(workflow).await?;

    let mut events = engine.subscribe();
    let execution = engine
        .execute_workflow(&workflow_id, parameters, &args.user, context)
        .await?;
    let execution_id = execution.execution_id.clone();
    info!(execution_id = %execution_id, workflow_id = %workflow_id, "Running workflow");

    if !ctx.json_output {
        println!();
        println!(
            "{} {}",
            style(format!("Running {}", execution.workflow_name)).bold(),
            Style::new().dim().apply_to(&execution_id)
        );
        println!();
    }

    let show = |event: &WorkflowEvent| {
        if !ctx.json_output && event.execution_id() == execution_id {
            print_event(event);
        }
    };

    let ctrl_c = tokio::signal::ctrl_c();
    let done = engine.wait_for_execution(&execution_id);
    tokio::pin!(ctrl_c, done);
    let mut interrupted = false;
    let finished = loop {
        tokio::select! {
            result = &mut done => break result?,
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                engine.cancel_execution(&execution_id).await;
            }
            event = events.recv() => match event {
                Ok(event) => show(&event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "Progress display fell behind");
                }
                Err(RecvError::Closed) => break (&mut done).await?,
            },
        }
    };
    while let Ok(event) = events.try_recv() {
        show(&event);
    }

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&finished)?);
    } else {
        print_summary(&finished, ctx.verbose);
    }

    match finished.status {
        ExecutionStatus::Completed => Ok(()),
        status => bail!(
            "workflow {}: {}",
            status,
            finished.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

/// Parse `key=value` pairs; values that are valid JSON keep their type.
fn parse_params(raw: &[String]) -> Result<HashMap<String, Value>> {
    raw.iter()
        .map(|pair| {
            let Some((key, value)) = pair.split_once('=') else {
                bail!("invalid parameter '{}': expected KEY=VALUE", pair);
            };
            let key = key.trim();
            if key.is_empty() {
                bail!("invalid parameter '{}': empty key", pair);
            }
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
            Ok((key.to_string(), value))
        })
        .collect()
}

fn load_context(path: &std::path::Path) -> Result<HashMap<String, Value>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading context file {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("{} must contain a JSON object", path.display()))
}

fn print_event(event: &WorkflowEvent) {
    let dim = Style::new().dim();
    match event {
        WorkflowEvent::StepStarted { step_id, .. } => {
            println!("  {} {}", dim.apply_to("▸"), step_id);
        }
        WorkflowEvent::StepRetrying {
            step_id,
            attempt,
            error,
            ..
        } => {
            println!(
                "  {} {} {}",
                Style::new().yellow().apply_to("↻"),
                step_id,
                dim.apply_to(format!("retry {} after: {}", attempt, error))
            );
        }
        WorkflowEvent::StepFinished { step_id, status, .. } => {
            println!("  {} {} {}", status_marker(*status), step_id, dim.apply_to(status));
        }
        WorkflowEvent::ExecutionStarted { .. } | WorkflowEvent::ExecutionFinished { .. } => {}
    }
}

fn status_marker(status: StepStatus) -> String {
    match status {
        StepStatus::Completed => Style::new().green().apply_to("✓").to_string(),
        StepStatus::Failed => Style::new().red().apply_to("✗").to_string(),
        StepStatus::Skipped => Style::new().dim().apply_to("○").to_string(),
        StepStatus::Cancelled => Style::new().yellow().apply_to("■").to_string(),
        StepStatus::Pending | StepStatus::Running => "·".to_string(),
    }
}

fn print_summary(execution: &WorkflowExecution, verbose: bool) {
    let dim = Style::new().dim();
    let status = match execution.status {
        ExecutionStatus::Completed => Style::new().green().apply_to("● completed"),
        ExecutionStatus::Failed => Style::new().red().apply_to("● failed"),
        ExecutionStatus::Cancelled => Style::new().yellow().apply_to("● cancelled"),
        ExecutionStatus::Pending | ExecutionStatus::Running => Style::new().apply_to("● running"),
    };

    println!();
    println!("{}", dim.apply_to("─".repeat(40)));
    println!("  {} {}", dim.apply_to("Status:"), status);
    println!(
        "  {} {}ms",
        dim.apply_to("Duration:"),
        execution.execution_time_ms
    );
    if let Some(error) = &execution.error {
        println!("  {} {}", dim.apply_to("Error:"), error);
    }
    for warning in &execution.warnings {
        println!("  {} {}", Style::new().yellow().apply_to("Warning:"), warning);
    }

    if verbose {
        println!();
        for step in &execution.steps {
            println!(
                "  {} {:<20} {}",
                status_marker(step.status),
                step.step_id,
                dim.apply_to(format!(
                    "{}ms, {} retries",
                    step.execution_time_ms, step.retry_count
                ))
            );
            if let Some(error) = &step.error {
                println!("      {}", error);
            }
        }
    }
    println!();
}
