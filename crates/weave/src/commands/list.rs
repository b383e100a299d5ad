//! List command - show the workflows in a directory.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use serde::Serialize;
use weave_workflow::load_workflow_dir;

use super::Context;

/// Arguments for the list command.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Workflow directory (default: `engine.workflow_dir` from config, then `./workflows`)
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

/// One workflow file for JSON output.
#[derive(Debug, Serialize)]
struct WorkflowEntry {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Run the list command.
pub async fn run(args: ListArgs, ctx: &Context) -> Result<()> {
    let dir = args
        .dir
        .or_else(|| ctx.config.engine().workflow_dir)
        .unwrap_or_else(|| PathBuf::from("workflows"));

    let entries: Vec<WorkflowEntry> = load_workflow_dir(&dir)?
        .into_iter()
        .map(|file| {
            let path = file.path.display().to_string();
            match file.result {
                Ok(workflow) => WorkflowEntry {
                    path,
                    steps: Some(workflow.steps.len()),
                    id: Some(workflow.id),
                    name: Some(workflow.name),
                    version: Some(workflow.version),
                    error: None,
                },
                Err(e) => WorkflowEntry {
                    path,
                    id: None,
                    name: None,
                    version: None,
                    steps: None,
                    error: Some(e.to_string()),
                },
            }
        })
        .collect();

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    let red = Style::new().red();

    println!();
    println!("{}", style(format!("Workflows in {}", dir.display())).bold());
    println!("{}", dim.apply_to("─".repeat(40)));

    if entries.is_empty() {
        println!("  {}", dim.apply_to("No workflow files found"));
    }

    for entry in &entries {
        match &entry.id {
            Some(id) => println!(
                "  {:<24} {} {}",
                id,
                entry.name.as_deref().unwrap_or_default(),
                dim.apply_to(format!(
                    "v{} · {} steps",
                    entry.version.as_deref().unwrap_or_default(),
                    entry.steps.unwrap_or_default()
                ))
            ),
            None => println!(
                "  {} {}",
                red.apply_to(&entry.path),
                dim.apply_to(entry.error.as_deref().unwrap_or_default())
            ),
        }
        if ctx.verbose && entry.id.is_some() {
            println!("  {:<24} {}", "", dim.apply_to(&entry.path));
        }
    }

    println!();
    Ok(())
}
