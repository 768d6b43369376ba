#[path = "common/mod.rs"]
mod common;

use std::{
    io::{Read, Write},
    net::TcpListener,
    sync::atomic::AtomicBool,
    thread,
    time::Duration,
};

use common::{shared_reaper, wait_until, write_layer};
use tempfile::tempdir;
use warden::{
    daemon::{Daemon, DaemonOptions},
    health,
    checks::{CheckStatus, probes::new_checker},
    plan::{Check, CheckLevel, HttpCheck},
    supervisor::ServiceStatus,
};

/// Minimal single-shot HTTP server answering every request with `status`.
fn serve_http(status: &'static str, body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut buffer = [0u8; 1024];
            let _ = stream.read(&mut buffer);
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    port
}

fn http_check(url: String) -> Check {
    Check {
        name: "http".to_string(),
        http: Some(HttpCheck {
            url,
            ..HttpCheck::default()
        }),
        ..Check::default()
    }
}

#[test]
fn http_probe_accepts_2xx() {
    let port = serve_http("200 OK", "fine");
    let checker = new_checker(
        &http_check(format!("http://127.0.0.1:{port}/health")),
        shared_reaper(),
    );
    checker
        .check(Duration::from_secs(3), &AtomicBool::new(false))
        .expect("2xx should pass");
}

#[test]
fn http_probe_reports_body_excerpt_on_failure() {
    let port = serve_http("500 Internal Server Error", "database on fire");
    let checker = new_checker(
        &http_check(format!("http://127.0.0.1:{port}/health")),
        shared_reaper(),
    );
    let err = checker
        .check(Duration::from_secs(3), &AtomicBool::new(false))
        .unwrap_err();
    assert!(err.message.contains("500"), "message: {}", err.message);
    assert_eq!(err.details.as_deref(), Some("database on fire"));
}

#[test]
fn check_failure_restarts_the_configured_service() {
    let temp = tempdir().expect("tempdir");
    let flag = temp.path().join("broken");

    write_layer(
        temp.path(),
        "001-main.yaml",
        &format!(
            r#"
services:
  watched:
    override: replace
    command: "sleep 60"
    startup: enabled
    on-check-failure:
      probe: restart
checks:
  probe:
    override: replace
    period: 300ms
    timeout: 200ms
    threshold: 2
    exec:
      command: "test ! -e {flag}"
"#,
            flag = flag.display()
        ),
    );

    let daemon = Daemon::new(DaemonOptions {
        dir: temp.path().to_path_buf(),
        sink: None,
        reaper: Some(shared_reaper()),
    });
    daemon.start().expect("start");

    let services = daemon.services();
    assert!(wait_until(Duration::from_secs(5), || {
        services
            .services()
            .first()
            .map(|info| info.status == ServiceStatus::Running)
            .unwrap_or(false)
    }));
    let first_pid = services.services()[0].pid.expect("pid");

    assert!(health::healthy(daemon.checks(), CheckLevel::Unset, &[]));

    // Break the check; two failures trip the threshold and the service
    // is restarted with a new process.
    std::fs::write(&flag, b"").expect("write flag");
    assert!(
        wait_until(Duration::from_secs(10), || {
            daemon
                .checks()
                .checks(CheckLevel::Unset, &[])
                .first()
                .map(|info| info.status == CheckStatus::Down)
                .unwrap_or(false)
        }),
        "check never went down"
    );
    assert!(!health::healthy(daemon.checks(), CheckLevel::Unset, &[]));

    assert!(
        wait_until(Duration::from_secs(15), || {
            services
                .services()
                .first()
                .and_then(|info| info.pid)
                .map(|pid| pid != first_pid)
                .unwrap_or(false)
        }),
        "service was not restarted after the check failure"
    );

    // Fix the check; it comes back up without further restarts.
    std::fs::remove_file(&flag).expect("remove flag");
    assert!(
        wait_until(Duration::from_secs(10), || {
            daemon
                .checks()
                .checks(CheckLevel::Unset, &[])
                .first()
                .map(|info| info.status == CheckStatus::Up && info.failures == 0)
                .unwrap_or(false)
        }),
        "check never recovered"
    );

    daemon.stop();
}

#[test]
fn ready_checks_answer_alive_queries() {
    let temp = tempdir().expect("tempdir");
    write_layer(
        temp.path(),
        "001-main.yaml",
        r#"
checks:
  readiness:
    override: replace
    level: ready
    period: 10s
    timeout: 1s
    exec:
      command: "true"
"#,
    );

    let daemon = Daemon::new(DaemonOptions {
        dir: temp.path().to_path_buf(),
        sink: None,
        reaper: Some(shared_reaper()),
    });
    daemon.start().expect("start");

    let ready = daemon.checks().checks(CheckLevel::Ready, &[]);
    assert_eq!(ready.len(), 1);
    let alive = daemon.checks().checks(CheckLevel::Alive, &[]);
    assert_eq!(alive.len(), 1, "alive queries include ready checks");

    daemon.stop();
}
