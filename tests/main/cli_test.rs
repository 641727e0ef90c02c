//! CLI contract tests.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;

fn main_source() -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src/main.rs");
    let source_result = fs::read_to_string(&path);
    assert!(source_result.is_ok());
    match source_result {
        Ok(source) => source,
        Err(err) => panic!("main source should load from {}: {err}", path.display()),
    }
}

#[test]
fn main_defines_primary_subcommands() {
    let source = main_source();
    assert!(source.contains("Start"));
    assert!(source.contains("Status"));
    assert!(source.contains("Queue"));
    assert!(source.contains("Campaigns"));
}

#[test]
fn help_lists_subcommands() {
    let output = Command::cargo_bin("courier")
        .expect("binary should build")
        .arg("--help")
        .output()
        .expect("help should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for name in ["start", "status", "queue", "campaigns"] {
        assert!(stdout.contains(name), "help should mention {name}");
    }
}

#[test]
fn queue_rejects_invalid_session_id() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    Command::cargo_bin("courier")
        .expect("binary should build")
        .env("HOME", tmp.path())
        .args(["queue", "bad-id"])
        .assert()
        .failure();
}
