#[path = "common/mod.rs"]
mod common;

use common::write_layer;
use tempfile::tempdir;
use warden::{plan::parse_layer, store::PlanStore};

#[test]
fn layered_plan_loads_merges_and_validates() {
    let temp = tempdir().expect("tempdir");
    write_layer(
        temp.path(),
        "001-base.yaml",
        r#"
summary: base services
services:
  web:
    override: replace
    command: "httpd -f"
    startup: enabled
    environment:
      MODE: "base"
      KEEP: "yes"
  db:
    override: replace
    command: "dbd"
checks:
  web-up:
    override: replace
    level: ready
    tcp:
      port: 8080
"#,
    );
    write_layer(
        temp.path(),
        "010-site.yaml",
        r#"
summary: site overrides
services:
  web:
    override: merge
    environment:
      MODE: "site"
    requires:
      - db
    after:
      - db
checks:
  web-up:
    override: merge
    period: 4s
    timeout: 2s
"#,
    );

    let store = PlanStore::new();
    let plan = store.load(temp.path()).expect("load");

    let web = &plan.services["web"];
    assert_eq!(web.command, "httpd -f");
    assert_eq!(web.environment["MODE"], "site");
    assert_eq!(web.environment["KEEP"], "yes");
    assert_eq!(web.requires, vec!["db".to_string()]);

    let check = &plan.checks["web-up"];
    assert_eq!(
        check.effective_period(),
        std::time::Duration::from_secs(4)
    );
}

#[test]
fn combination_is_deterministic_across_loads() {
    let temp = tempdir().expect("tempdir");
    write_layer(
        temp.path(),
        "001-base.yaml",
        r#"
services:
  zeta:
    override: replace
    command: "z"
  alpha:
    override: replace
    command: "a"
    environment:
      B: "2"
      A: "1"
"#,
    );

    let first = PlanStore::new()
        .load(temp.path())
        .expect("load")
        .to_yaml()
        .expect("yaml");
    let second = PlanStore::new()
        .load(temp.path())
        .expect("load")
        .to_yaml()
        .expect("yaml");
    assert_eq!(first, second);
}

#[test]
fn before_after_loop_is_rejected_with_members() {
    let temp = tempdir().expect("tempdir");
    write_layer(
        temp.path(),
        "001-loop.yaml",
        r#"
services:
  x:
    override: replace
    command: "x"
    after:
      - y
  y:
    override: replace
    command: "y"
    after:
      - z
  z:
    override: replace
    command: "z"
    after:
      - x
"#,
    );

    let err = PlanStore::new().load(temp.path()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "services in before/after loop: x, y, z"
    );
}

#[test]
fn parsed_layers_round_trip_through_yaml() {
    let yaml = r#"
summary: round trip
services:
  web:
    override: replace
    command: "httpd -f [ --verbose ]"
    startup: enabled
    backoff-delay: 250ms
    backoff-factor: 1.5
    kill-delay: 10s
    on-check-failure:
      web-up: restart
checks:
  web-up:
    override: replace
    level: alive
    period: 30s
    threshold: 5
    http:
      url: "http://localhost:8080/health"
      headers:
        X-Probe: "warden"
"#;

    let layer = parse_layer(1, "round", yaml).expect("parse");
    let serialized = layer.to_yaml().expect("serialize");
    let reparsed = parse_layer(1, "round", &serialized).expect("reparse");
    assert_eq!(reparsed, layer);
}

#[test]
fn unknown_keys_reject_the_layer() {
    let temp = tempdir().expect("tempdir");
    write_layer(
        temp.path(),
        "001-bad.yaml",
        r#"
services:
  web:
    override: replace
    command: "httpd"
    restart-policy: always
"#,
    );

    let err = PlanStore::new().load(temp.path()).unwrap_err();
    assert!(
        err.to_string().contains("restart-policy"),
        "unexpected error: {err}"
    );
}
