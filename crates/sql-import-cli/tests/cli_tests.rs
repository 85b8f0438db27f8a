//! CLI integration tests for sql-import.
//!
//! These tests verify CLI argument parsing, help output and exit codes
//! without a SQL Server or PostgreSQL instance.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::path::Path;

fn cmd() -> Command {
    Command::cargo_bin("sql-import").unwrap()
}

/// A config with an in-memory target and jobs kept under `state_dir`.
fn memory_config(state_dir: &Path) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
settings:
  state_dir: "{}"
target:
  type: memory
  entities:
    res.partner:
      - {{ name: name, field_type: char, required: true }}
      - {{ name: active, field_type: boolean, required: false }}
      - {{ name: display_name, field_type: char, required: false, readonly: true }}
"#,
        state_dir.display()
    )
    .unwrap();
    file
}

/// A config whose only connection points at a closed local port.
fn unreachable_config(state_dir: &Path) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
settings:
  state_dir: "{}"
target:
  type: memory
connections:
  - name: legacy
    server: 127.0.0.1
    port: 1
    database: legacy
    username: sa
    password: secret
    timeout_secs: 1
"#,
        state_dir.display()
    )
    .unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_displays() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Import SQL Server tables into application entities",
        ));
}

#[test]
fn test_version_displays() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sql-import"));
}

#[test]
fn test_help_lists_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("test-connection"))
        .stdout(predicate::str::contains("fetch-tables"))
        .stdout(predicate::str::contains("generate-mapping"))
        .stdout(predicate::str::contains("test-mapping"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("retry"))
        .stdout(predicate::str::contains("jobs"));
}

#[test]
fn test_log_flags_have_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("[default: sql-import.yaml]"));
}

#[test]
fn test_retry_requires_job_id() {
    cmd()
        .arg("retry")
        .assert()
        .failure()
        .stderr(predicate::str::contains("<JOB_ID>"));
}

#[test]
fn test_no_subcommand_shows_usage() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_1() {
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "jobs"])
        .assert()
        .code(1);
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "jobs"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_target_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "connections: []").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "jobs"])
        .assert()
        .code(2);
}

#[test]
fn test_unknown_mapping_exits_with_code_2() {
    let dir = tempfile::tempdir().unwrap();
    let config = memory_config(dir.path());

    cmd()
        .args(["--config", config.path().to_str().unwrap(), "validate", "vendors"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unknown mapping 'vendors'"));
}

#[test]
fn test_unknown_job_exits_with_code_6() {
    let dir = tempfile::tempdir().unwrap();
    let config = memory_config(dir.path());

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "job",
            "3f1c2a9e-0000-4000-8000-000000000000",
        ])
        .assert()
        .code(6);
}

// =============================================================================
// Commands Against an In-Memory Target
// =============================================================================

#[test]
fn test_jobs_empty_state_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = memory_config(dir.path());

    cmd()
        .args(["--config", config.path().to_str().unwrap(), "jobs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No import jobs."));
}

#[test]
fn test_target_fields_lists_flags() {
    let dir = tempfile::tempdir().unwrap();
    let config = memory_config(dir.path());

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "target-fields",
            "res.partner",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("name char [required]"))
        .stdout(predicate::str::contains("display_name char [readonly]"));
}

#[test]
fn test_target_fields_json() {
    let dir = tempfile::tempdir().unwrap();
    let config = memory_config(dir.path());

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "--output-json",
            "target-fields",
            "res.partner",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"active\""));
}

#[test]
fn test_unknown_entity_exits_with_code_6() {
    let dir = tempfile::tempdir().unwrap();
    let config = memory_config(dir.path());

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "target-fields",
            "res.unknown",
        ])
        .assert()
        .code(6);
}

// =============================================================================
// Source Commands Connect Before Use
// =============================================================================

#[test]
fn test_fetch_tables_tries_to_connect() {
    let dir = tempfile::tempdir().unwrap();
    let config = unreachable_config(dir.path());

    cmd()
        .args(["--config", config.path().to_str().unwrap(), "fetch-tables", "legacy"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("not connected").not());
}

#[test]
fn test_columns_tries_to_connect() {
    let dir = tempfile::tempdir().unwrap();
    let config = unreachable_config(dir.path());

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "columns",
            "legacy",
            "dbo.Customers",
        ])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("not connected").not());
}
