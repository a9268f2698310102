//! Integration tests for the `quill` command.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn quill() -> Command {
    let mut cmd = Command::cargo_bin("quill").unwrap();
    cmd.env_remove("RUST_LOG").arg("--log-level").arg("warn");
    cmd
}

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("quill.toml");
    fs::write(&path, contents).unwrap();
    path
}

fn run_creation(data_dir: &Path, project: &str) {
    quill()
        .args(["run", "--template", "novel_creation", "--project", project, "--data-dir"])
        .arg(data_dir)
        .args(["--param", "requirements=a lighthouse mystery"])
        .assert()
        .success();
}

#[test]
fn test_templates_lists_builtin() {
    quill()
        .arg("templates")
        .assert()
        .success()
        .stdout(predicate::str::contains("novel_creation"))
        .stdout(predicate::str::contains("novel_continuation"))
        .stdout(predicate::str::contains("after tag_selection, character_creation"));
}

#[test]
fn test_templates_json() {
    let output = quill().args(["templates", "--json"]).output().unwrap();
    assert!(output.status.success());

    let templates: Vec<Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(templates.len(), 2);
    assert_eq!(templates[0]["name"], "novel_continuation");
    assert_eq!(templates[1]["steps"].as_array().unwrap().len(), 5);
}

#[test]
fn test_run_persists_documents() {
    let dir = TempDir::new().unwrap();
    quill()
        .args(["run", "-t", "novel_creation", "-p", "lighthouse", "--data-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("quality_assessment"));

    let project = dir.path().join("projects").join("lighthouse");
    for kind in ["tag_selection", "character_creation", "storyline_generation", "chapter_writing", "quality_assessment"] {
        assert!(project.join(format!("{kind}.json")).exists(), "{kind} not stored");
    }
}

#[test]
fn test_run_json_output() {
    let dir = TempDir::new().unwrap();
    let output = quill()
        .args(["run", "--template", "novel_continuation", "--project", "sequel", "--json", "--data-dir"])
        .arg(dir.path())
        .args(["--param", "existing_content=It was raining.", "--param", "chapters=2"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let results: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(results["status"], "completed");
    assert_eq!(results["progress"], 100.0);
    let prompt = results["results"]["continuation_analysis"]["prompt"].as_str().unwrap();
    assert!(prompt.contains("It was raining."));
}

#[test]
fn test_show_document_and_kinds() {
    let dir = TempDir::new().unwrap();
    run_creation(dir.path(), "beacon");

    quill()
        .args(["show", "--project", "beacon", "--kind", "tag_selection", "--data-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("a lighthouse mystery"));

    quill()
        .args(["show", "--project", "beacon", "--data-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("chapter_writing"))
        .stdout(predicate::str::contains("storyline_generation"));
}

#[test]
fn test_show_missing_document_fails() {
    let dir = TempDir::new().unwrap();
    quill()
        .args(["show", "--project", "nobody", "--kind", "outline", "--data-dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("No 'outline' document stored"));
}

#[test]
fn test_run_unknown_template_fails() {
    let dir = TempDir::new().unwrap();
    quill()
        .args(["run", "--template", "poetry", "--project", "p", "--data-dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown workflow template 'poetry'"));
}

#[test]
fn test_run_rejects_malformed_param() {
    quill()
        .args(["run", "--template", "novel_creation", "--project", "p", "--param", "novalue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected key=value"));
}

#[test]
fn test_failed_workflow_exits_with_failure() {
    let dir = TempDir::new().unwrap();
    let template = dir.path().join("haiku.toml");
    fs::write(
        &template,
        "name = \"haiku\"\n\n[[steps]]\nid = \"verse\"\ncapability = \"poet\"\n",
    )
    .unwrap();
    let config = write_config(
        &dir,
        &format!(
            "[retry]\nmax_retries = 2\nbase_delay_ms = 10\n\n[templates]\nfiles = [{:?}]\n",
            template.display().to_string()
        ),
    );

    quill()
        .arg("--config")
        .arg(&config)
        .args(["run", "--template", "haiku", "--project", "p", "--data-dir"])
        .arg(dir.path())
        .assert()
        .code(1)
        .stdout(predicate::str::contains("failed"))
        .stdout(predicate::str::contains("CapabilityNotRegistered: poet"));
}

#[test]
fn test_config_layers() {
    quill().arg("config").assert().success().stdout(predicate::str::contains("max_retries = 3"));

    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "[retry]\nmax_retries = 5\n");
    quill()
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_retries = 5"));

    quill()
        .env("QUILL__SCHEDULER__MAX_CONCURRENT_TASKS", "3")
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_concurrent_tasks = 3"))
        .stdout(predicate::str::contains("max_retries = 5"));
}

#[test]
fn test_missing_config_file_fails() {
    quill()
        .args(["--config", "/nonexistent/quill.toml", "config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}
