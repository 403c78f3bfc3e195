//! CLI surface smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn loupe() -> Command {
    Command::cargo_bin("loupe").expect("binary built")
}

#[test]
fn help_lists_subcommands() {
    loupe()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("review"))
        .stdout(predicate::str::contains("context"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn status_on_fresh_store_reports_no_runs() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("loupe.toml");
    std::fs::write(
        &config_path,
        format!(
            "[store]\ndb_path = \"{}\"\n",
            dir.path().join("loupe.db").display()
        ),
    )
    .unwrap();

    loupe()
        .args(["--config", config_path.to_str().unwrap(), "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no review runs recorded"));
}

#[test]
fn status_json_is_empty_array() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("loupe.toml");
    std::fs::write(
        &config_path,
        format!(
            "[store]\ndb_path = \"{}\"\n",
            dir.path().join("loupe.db").display()
        ),
    )
    .unwrap();

    loupe()
        .args(["--config", config_path.to_str().unwrap(), "--json", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn review_requires_arguments() {
    loupe()
        .arg("review")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--repo"));
}

#[test]
fn invalid_sha_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("loupe.toml");
    std::fs::write(
        &config_path,
        format!(
            "[store]\ndb_path = \"{}\"\n\n[kg]\nuri = \"bolt://127.0.0.1:1\"\n\n[timeouts]\nkg_connection_secs = 1\n",
            dir.path().join("loupe.db").display()
        ),
    )
    .unwrap();

    loupe()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "review",
            "--repo",
            "octo/widgets",
            "--pr",
            "1",
            "--head-sha",
            "tooshort",
            "--base-sha",
            "alsoshort",
            "--repo-id",
            "123e4567-e89b-12d3-a456-426614174000",
            "--dry-run",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("40-char"));
}
