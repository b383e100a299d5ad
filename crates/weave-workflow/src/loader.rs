//! Loading workflow TOML files from a directory.
//!
//! Every `*.toml` file in the directory is parsed and fully validated
//! (including dependency references and cycles). Invalid files are reported
//! alongside the valid ones and never prevent the rest from loading.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::definition::{WorkflowDefinition, WorkflowFile};
use crate::error::{Result, WorkflowError};
use crate::graph::DependencyGraph;

/// Outcome of loading one workflow file.
#[derive(Debug)]
pub struct LoadedFile {
    pub path: PathBuf,
    pub result: Result<WorkflowDefinition>,
}

/// Parse and validate a single workflow file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition> {
    debug!("Loading workflow file: {}", path.display());
    let file = WorkflowFile::from_file(path)?;
    file.workflow.validate()?;
    DependencyGraph::build(&file.workflow)?;
    Ok(file.workflow)
}

/// Load every workflow file in `dir`, sorted by path.
///
/// Fails only if the directory itself cannot be read.
pub fn load_workflow_dir(dir: &Path) -> Result<Vec<LoadedFile>> {
    let entries = std::fs::read_dir(dir).map_err(|source| WorkflowError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| is_workflow_file(path))
        .collect();
    paths.sort();

    let loaded: Vec<LoadedFile> = paths
        .into_iter()
        .map(|path| {
            let result = load_workflow_file(&path);
            if let Err(e) = &result {
                warn!("Invalid workflow in {}: {}", path.display(), e);
            }
            LoadedFile { path, result }
        })
        .collect();

    info!(
        "Loaded {} of {} workflow files from {}",
        loaded.iter().filter(|f| f.result.is_ok()).count(),
        loaded.len(),
        dir.display()
    );
    Ok(loaded)
}

fn is_workflow_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "toml")
}
