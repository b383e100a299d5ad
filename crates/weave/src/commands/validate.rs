//! Validate command - parse and check workflow files.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use console::{Style, style};
use serde::Serialize;
use weave_workflow::load_workflow_file;

use super::Context;

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Workflow TOML files
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

/// Per-file result for JSON output.
#[derive(Debug, Serialize)]
struct ValidationOutput {
    path: String,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Run the validate command.
pub async fn run(args: ValidateArgs, ctx: &Context) -> Result<()> {
    let results: Vec<ValidationOutput> = args
        .files
        .iter()
        .map(|path| match load_workflow_file(path) {
            Ok(workflow) => ValidationOutput {
                path: path.display().to_string(),
                valid: true,
                workflow_id: Some(workflow.id),
                steps: Some(workflow.steps.len()),
                error: None,
            },
            Err(e) => ValidationOutput {
                path: path.display().to_string(),
                valid: false,
                workflow_id: None,
                steps: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        let green = Style::new().green();
        let red = Style::new().red();
        let dim = Style::new().dim();

        for result in &results {
            if result.valid {
                println!(
                    "{} {} {}",
                    green.apply_to("✓"),
                    result.path,
                    dim.apply_to(format!(
                        "({}, {} steps)",
                        result.workflow_id.as_deref().unwrap_or_default(),
                        result.steps.unwrap_or_default()
                    ))
                );
            } else {
                println!("{} {}", red.apply_to("✗"), style(&result.path).bold());
                println!("  {}", result.error.as_deref().unwrap_or_default());
            }
        }
    }

    let invalid = results.iter().filter(|r| !r.valid).count();
    if invalid > 0 {
        bail!("{} of {} workflow files are invalid", invalid, results.len());
    }
    Ok(())
}
