//! CLI integration tests for the weave command-line interface.
//!
//! These tests verify:
//! - Help text and argument parsing
//! - Validation and listing of workflow files
//! - Running workflows end-to-end against the dry-run agent
//!
//! Every test runs inside a temp directory with `WEAVE_CONFIG_DIR` pointed
//! at it, so no user config or log directory is touched.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const TRIAGE: &str = r#"
[workflow]
id = "triage"
name = "Symptom triage"

[[workflow.steps]]
id = "init"
name = "Initial analysis"
agent = "xiaoai"
action = "initial_analysis"
parameters = { patient = "{{patient_id}}" }

[[workflow.steps]]
id = "check"
name = "Severity check"
type = "condition"
dependencies = ["init"]
condition = { field = "severity", operator = "greater_than", value = 5 }

[[workflow.steps]]
id = "detailed"
name = "Detailed analysis"
agent = "xiaoai"
action = "detailed_analysis"
dependencies = ["check"]
condition = { field = "step_check_condition", operator = "equals", value = true }

[[workflow.steps]]
id = "advice"
name = "General advice"
agent = "xiaoai"
action = "general_advice"
dependencies = ["check"]
condition = { field = "step_check_condition", operator = "equals", value = false }

[[workflow.steps]]
id = "summary"
name = "Summary"
agent = "xiaoai"
action = "summarize"
dependencies = ["detailed", "advice"]
"#;

const CYCLIC: &str = r#"
[workflow]
id = "loop"
name = "Loop"

[[workflow.steps]]
id = "a"
name = "A"
agent = "x"
action = "y"
dependencies = ["b"]

[[workflow.steps]]
id = "b"
name = "B"
agent = "x"
action = "y"
dependencies = ["a"]
"#;

const UNRESOLVED: &str = r#"
[workflow]
id = "unresolved"
name = "Unresolved"

[[workflow.steps]]
id = "a"
name = "A"
agent = "x"
action = "y"
parameters = { input = "{{step_nothing_result}}" }
"#;

/// Get a command for the weave binary, isolated in `dir`.
fn weave(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("weave").unwrap();
    cmd.current_dir(dir)
        .env("WEAVE_CONFIG_DIR", dir)
        .env_remove("WEAVE_CONFIG")
        .env_remove("WEAVE_AGENT_URL")
        .env_remove("RUST_LOG");
    cmd
}

fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("workflows")).unwrap();
    std::fs::write(dir.path().join("workflows/triage.toml"), TRIAGE).unwrap();
    dir
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    weave(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_version_displays() {
    let dir = TempDir::new().unwrap();
    weave(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("weave"));
}

#[test]
fn test_unknown_subcommand_rejected() {
    let dir = TempDir::new().unwrap();
    weave(dir.path()).arg("frobnicate").assert().failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// Validate
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_validate_valid_file() {
    let dir = workspace();
    weave(dir.path())
        .args(["validate", "workflows/triage.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("triage"))
        .stdout(predicate::str::contains("5 steps"));
}

#[test]
fn test_validate_cycle_fails() {
    let dir = workspace();
    std::fs::write(dir.path().join("loop.toml"), CYCLIC).unwrap();
    weave(dir.path())
        .args(["validate", "workflows/triage.toml", "loop.toml"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Cycle detected"))
        .stderr(predicate::str::contains("1 of 2 workflow files are invalid"));
}

#[test]
fn test_validate_json_output() {
    let dir = workspace();
    weave(dir.path())
        .args(["--json", "validate", "workflows/triage.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"valid\": true"))
        .stdout(predicate::str::contains("\"workflow_id\": \"triage\""));
}

#[test]
fn test_validate_requires_files() {
    let dir = TempDir::new().unwrap();
    weave(dir.path()).arg("validate").assert().failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// List
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_list_default_directory() {
    let dir = workspace();
    weave(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("triage"))
        .stdout(predicate::str::contains("Symptom triage"));
}

#[test]
fn test_list_dir_from_config() {
    let dir = workspace();
    std::fs::create_dir(dir.path().join("flows")).unwrap();
    std::fs::write(dir.path().join("flows/loop.toml"), CYCLIC).unwrap();
    std::fs::write(
        dir.path().join("weave.toml"),
        "[engine]\nworkflow_dir = \"flows\"\n",
    )
    .unwrap();

    weave(dir.path())
        .args(["--json", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("loop.toml"))
        .stdout(predicate::str::contains("Cycle detected"))
        .stdout(predicate::str::contains("triage").not());
}

#[test]
fn test_list_missing_directory_fails() {
    let dir = TempDir::new().unwrap();
    weave(dir.path())
        .args(["list", "--dir", "nowhere"])
        .assert()
        .failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_run_dry_run_completes() {
    let dir = workspace();
    weave(dir.path())
        .args([
            "--json",
            "run",
            "workflows/triage.toml",
            "--dry-run",
            "--param",
            "severity=6",
            "--param",
            "patient_id=p-42",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"workflow_id\": \"triage\""))
        .stdout(predicate::str::contains("\"step_check_condition\": true"))
        .stdout(predicate::str::contains("\"patient\": \"p-42\""));
}

#[test]
fn test_run_human_output() {
    let dir = workspace();
    weave(dir.path())
        .args([
            "run",
            "workflows/triage.toml",
            "--dry-run",
            "-p",
            "severity=2",
            "-p",
            "patient_id=p-1",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Running Symptom triage"))
        .stdout(predicate::str::contains("detailed"))
        .stdout(predicate::str::contains("completed"));
}

#[test]
fn test_run_failed_execution_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("unresolved.toml"), UNRESOLVED).unwrap();
    weave(dir.path())
        .args(["run", "unresolved.toml", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("workflow failed"))
        .stderr(predicate::str::contains("step_nothing_result"));
}

#[test]
fn test_run_context_file() {
    let dir = workspace();
    std::fs::write(dir.path().join("ctx.json"), r#"{"patient_id": "from-context", "severity": 9}"#)
        .unwrap();
    weave(dir.path())
        .args([
            "--json",
            "run",
            "workflows/triage.toml",
            "--dry-run",
            "--context",
            "ctx.json",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"patient\": \"from-context\""));
}

#[test]
fn test_run_invalid_workflow_fails() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("loop.toml"), CYCLIC).unwrap();
    weave(dir.path())
        .args(["run", "loop.toml", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cycle detected"));
}

#[test]
fn test_run_bad_param_fails() {
    let dir = workspace();
    weave(dir.path())
        .args(["run", "workflows/triage.toml", "--dry-run", "--param", "severity"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected KEY=VALUE"));
}

#[test]
fn test_explicit_config_file() {
    let dir = workspace();
    std::fs::write(
        dir.path().join("custom.toml"),
        "[engine]\nretry_base_delay_ms = 10\nretry_max_delay_ms = 1\n",
    )
    .unwrap();
    weave(dir.path())
        .args(["--config", "custom.toml", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("retry_base_delay_ms"));
}
