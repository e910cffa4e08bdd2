//! End-to-end tests for the pm-scrub binary.
//!
//! Every test points `--config` at a fresh temp directory so the user's
//! own configuration never leaks in.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

const CONTACT_BATCH: &str = r#"{
    "incidents": [
        {
            "id": "INC-100",
            "text": "Contact: john.doe@company.com, Phone: +1-555-123-4567",
            "detections": {
                "deterministic": [
                    {"start": 9, "end": 29, "entity_type": "EMAIL"},
                    {"start": 38, "end": 53, "entity_type": "PHONE"}
                ],
                "finder": [
                    {"start": 9, "end": 29, "entity_type": "EMAIL", "confidence": 0.97}
                ]
            }
        },
        {
            "id": "INC-101",
            "text": "Escalated to John Smith",
            "detections": {
                "judge": [{"start": 13, "end": 23, "entity_type": "PERSON", "reasoning": "on-call engineer"}]
            }
        }
    ]
}"#;

/// Get a Command for the pm-scrub binary with an isolated config dir.
fn pm_scrub(config_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("pm-scrub").expect("pm-scrub binary should exist");
    cmd.env_remove("PM_LOG")
        .env_remove("PM_LOG_FORMAT")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(config_dir);
    cmd
}

fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

#[test]
fn version_prints_json() {
    let dir = TempDir::new().unwrap();
    pm_scrub(dir.path())
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pm_scrub_version"));
}

#[test]
fn unknown_command_is_args_error() {
    let dir = TempDir::new().unwrap();
    pm_scrub(dir.path())
        .arg("nonexistent-command")
        .assert()
        .code(10)
        .stderr(predicate::str::contains("error"));
}

#[test]
fn run_redacts_and_exits_clean() {
    let dir = TempDir::new().unwrap();
    let input = write(&dir, "batch.json", CONTACT_BATCH);

    let output = pm_scrub(dir.path()).arg("run").arg(&input).output().unwrap();
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report = stdout_json(&output);
    assert_eq!(
        report["incidents"][0]["processed_text"],
        "Contact: [REDACTED_EMAIL], Phone: [REDACTED_PHONE]"
    );
    assert_eq!(report["incidents"][0]["status"], "processed");
    let second = report["incidents"][1]["processed_text"].as_str().unwrap();
    assert!(second.starts_with("Escalated to Person_"));
    assert_eq!(report["summary"]["processed"], 2);
    assert!(report["run_id"].as_str().unwrap().starts_with("run-"));
    assert!(report["policy_hash"].as_str().is_some());

    // Nothing original survives anywhere in the report.
    let raw = String::from_utf8_lossy(&output.stdout);
    assert!(!raw.contains("john.doe@company.com"));
    assert!(!raw.contains("John Smith"));
}

#[test]
fn run_reads_stdin_and_writes_output_file() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("report.json");
    pm_scrub(dir.path())
        .args(["run", "-", "--compact", "-o"])
        .arg(&out)
        .write_stdin(CONTACT_BATCH)
        .assert()
        .success();

    let content = std::fs::read_to_string(&out).unwrap();
    assert_eq!(content.trim_end().lines().count(), 1);
    let report: Value = serde_json::from_str(&content).unwrap();
    assert_eq!(report["summary"]["incidents"], 2);
}

#[test]
fn residual_pii_exits_critical() {
    let dir = TempDir::new().unwrap();
    let input = write(
        &dir,
        "batch.json",
        r#"{"incidents": [{"id": "A", "text": "ssn 123-45-6789 leaked"}]}"#,
    );
    let output = pm_scrub(dir.path()).arg("run").arg(&input).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let report = stdout_json(&output);
    assert_eq!(report["summary"]["residual_pii"], 1);
}

#[test]
fn builtin_detector_flag_closes_the_gap() {
    let dir = TempDir::new().unwrap();
    let input = write(
        &dir,
        "batch.json",
        r#"{"incidents": [{"id": "A", "text": "ssn 123-45-6789 leaked"}]}"#,
    );
    let output = pm_scrub(dir.path())
        .args(["run", "--builtin-detector"])
        .arg(&input)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let report = stdout_json(&output);
    assert_eq!(report["incidents"][0]["processed_text"], "ssn [REDACTED_SSN] leaked");
}

#[test]
fn malformed_policy_is_config_error() {
    let dir = TempDir::new().unwrap();
    let input = write(&dir, "batch.json", CONTACT_BATCH);
    let policy = write(&dir, "bad-policy.json", r#"{"policies": [{"category": "PII"}]}"#);
    pm_scrub(dir.path())
        .arg("run")
        .arg(&input)
        .arg("--policy")
        .arg(&policy)
        .assert()
        .code(11)
        .stdout(predicate::str::is_empty());
}

#[test]
fn missing_input_is_io_error() {
    let dir = TempDir::new().unwrap();
    pm_scrub(dir.path())
        .args(["run", "/nonexistent/batch.json"])
        .assert()
        .code(21);
}

#[test]
fn duplicate_incident_ids_are_args_error() {
    let dir = TempDir::new().unwrap();
    let input = write(
        &dir,
        "batch.json",
        r#"{"incidents": [{"id": "A", "text": "x"}, {"id": "A", "text": "y"}]}"#,
    );
    pm_scrub(dir.path())
        .arg("run")
        .arg(&input)
        .assert()
        .code(10)
        .stderr(predicate::str::contains("duplicate"));
}

#[test]
fn zero_parallelism_is_args_error() {
    let dir = TempDir::new().unwrap();
    let input = write(&dir, "batch.json", CONTACT_BATCH);
    pm_scrub(dir.path())
        .arg("run")
        .arg(&input)
        .args(["--max-parallel", "0"])
        .assert()
        .code(10);
}

#[test]
fn salt_from_config_dir_gives_stable_tokens() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "config.json",
        r#"{"schema_version": "1.0.0", "pseudonym": {"salt": "team-salt", "key_id": "team"}}"#,
    );
    let input = write(&dir, "batch.json", CONTACT_BATCH);

    let run = || {
        let output = pm_scrub(dir.path()).arg("run").arg(&input).output().unwrap();
        assert_eq!(output.status.code(), Some(0));
        stdout_json(&output)
    };
    let a = run();
    let b = run();
    assert_eq!(a["incidents"][1]["processed_text"], b["incidents"][1]["processed_text"]);
    assert_eq!(a["key_id"], "team");
}

#[test]
fn check_policy_reports_builtin() {
    let dir = TempDir::new().unwrap();
    let output = pm_scrub(dir.path()).arg("check-policy").output().unwrap();
    assert!(output.status.success());
    let response = stdout_json(&output);
    assert_eq!(response["status"], "valid");
    assert_eq!(response["using_defaults"], true);
    assert!(response["entity_types"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e == "EMAIL_ADDRESS"));
}

#[test]
fn check_policy_rejects_conflicting_force_rules() {
    let dir = TempDir::new().unwrap();
    let policy = write(
        &dir,
        "policy.json",
        r#"{
            "patterns": [{"name": "email", "category": "PII", "entities": ["EMAIL_ADDRESS"]}],
            "policies": [
                {"category": "PII", "sensitivity_level": "HIGH", "action": "REDACT", "patterns": ["email"], "force": true},
                {"category": "PII", "sensitivity_level": "HIGH", "action": "PSEUDONYMIZE", "patterns": ["email"], "force": true}
            ]
        }"#,
    );
    pm_scrub(dir.path())
        .arg("check-policy")
        .arg(&policy)
        .assert()
        .code(11);
}

#[test]
fn show_config_masks_secrets() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "config.json",
        r#"{"pseudonym": {"salt": "do-not-print-me"}}"#,
    );
    pm_scrub(dir.path())
        .arg("show-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("do-not-print-me").not())
        .stdout(predicate::str::contains("policy_hash"));
}
