#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use assert_cmd::Command;
use common::write_layer;
use predicates::prelude::*;
use tempfile::tempdir;

fn wardend() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("wardend"))
}

#[test]
fn validate_prints_the_effective_plan() {
    let temp = tempdir().expect("tempdir");
    write_layer(
        temp.path(),
        "001-base.yaml",
        r#"
services:
  web:
    override: replace
    command: "httpd -f"
    environment:
      MODE: "base"
"#,
    );
    write_layer(
        temp.path(),
        "002-site.yaml",
        r#"
services:
  web:
    override: merge
    environment:
      MODE: "site"
"#,
    );

    wardend()
        .arg("validate")
        .arg("--dir")
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("httpd -f"))
        .stdout(predicate::str::contains("MODE: site"));
}

#[test]
fn validate_rejects_a_broken_plan() {
    let temp = tempdir().expect("tempdir");
    write_layer(
        temp.path(),
        "001-base.yaml",
        r#"
services:
  web:
    override: replace
"#,
    );

    wardend()
        .arg("validate")
        .arg("--dir")
        .arg(temp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("command"));
}

#[test]
fn validate_rejects_bad_layer_filenames() {
    let temp = tempdir().expect("tempdir");
    write_layer(temp.path(), "base.yaml", "summary: unlabelled\n");

    wardend()
        .arg("validate")
        .arg("--dir")
        .arg(temp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid layer filename"));
}

#[test]
fn run_exits_when_a_service_requests_shutdown() {
    let temp = tempdir().expect("tempdir");
    write_layer(
        temp.path(),
        "001-base.yaml",
        r#"
services:
  short:
    override: replace
    command: "sleep 1.5"
    startup: enabled
    on-success: shutdown
"#,
    );

    wardend()
        .arg("--log-level")
        .arg("debug")
        .arg("run")
        .arg("--dir")
        .arg(temp.path())
        .timeout(Duration::from_secs(30))
        .assert()
        .success();
}
