#[path = "common/mod.rs"]
mod common;

use std::{collections::BTreeMap, fs, sync::Arc, time::{Duration, Instant}};

use common::{shared_reaper, wait_until};
use tempfile::tempdir;
use warden::{
    changelog::MemoryChangeSink,
    plan::{OptionalDuration, OptionalFloat, Plan, Service, ServiceAction},
    supervisor::{ServiceManager, ServiceStatus},
};

fn manager() -> Arc<ServiceManager> {
    ServiceManager::new(shared_reaper(), Arc::new(MemoryChangeSink::new()))
}

fn plan_with(services: Vec<Service>) -> Arc<Plan> {
    let mut map = BTreeMap::new();
    for service in services {
        map.insert(service.name.clone(), service);
    }
    Arc::new(Plan {
        services: map,
        ..Plan::default()
    })
}

fn status_of(manager: &ServiceManager, name: &str) -> ServiceStatus {
    manager
        .services()
        .into_iter()
        .find(|info| info.name == name)
        .map(|info| info.status)
        .expect("service exists")
}

#[test]
fn dependent_services_start_in_order_and_sequentially() {
    let temp = tempdir().expect("tempdir");
    let log = temp.path().join("spawns");
    let marker = |name: &str| Service {
        name: name.to_string(),
        command: format!("sh -c \"echo {name} >> {}; exec sleep 60\"", log.display()),
        ..Service::default()
    };

    let a = marker("a");
    let mut b = marker("b");
    let mut c = marker("c");
    b.requires = vec!["a".to_string()];
    b.after = vec!["a".to_string()];
    c.requires = vec!["b".to_string()];
    c.after = vec!["b".to_string()];

    let manager = manager();
    manager.plan_changed(&plan_with(vec![a.clone(), b.clone(), c.clone()]));

    // Starting only "c" pulls a and b in through requires.
    let begun = Instant::now();
    manager.start(&["c".to_string()]).expect("start");
    let elapsed = begun.elapsed();

    let spawned = fs::read_to_string(&log).expect("spawn log");
    let order: Vec<&str> = spawned.lines().collect();
    assert_eq!(order, vec!["a", "b", "c"]);

    // Each start waits out the previous service's grace window, so the
    // whole request takes at least two windows before c even spawns.
    assert!(
        elapsed >= Duration::from_secs(2),
        "starts were not sequential: {elapsed:?}"
    );

    for name in ["a", "b", "c"] {
        assert_eq!(status_of(&manager, name), ServiceStatus::Running);
    }

    // Stopping "a" pulls the dependents in, in reverse order.
    manager.stop(&["a".to_string()]).expect("stop");
    for name in ["a", "b", "c"] {
        assert_eq!(status_of(&manager, name), ServiceStatus::Stopped);
    }
}

#[test]
fn failing_service_backs_off_exponentially() {
    let temp = tempdir().expect("tempdir");
    let log = temp.path().join("attempts");

    let service = Service {
        name: "flaky".to_string(),
        command: format!("sh -c \"date +%s%N >> {}; exit 1\"", log.display()),
        on_failure: ServiceAction::Restart,
        backoff_delay: OptionalDuration::new(Duration::from_millis(150)),
        backoff_factor: OptionalFloat::new(2.0),
        backoff_limit: OptionalDuration::new(Duration::from_millis(600)),
        ..Service::default()
    };

    let manager = manager();
    manager.plan_changed(&plan_with(vec![service]));

    // The immediate exit fails the start; the worker keeps respawning
    // with backoff regardless.
    manager.start(&["flaky".to_string()]).expect_err("short-lived start fails");

    assert!(
        wait_until(Duration::from_secs(10), || {
            fs::read_to_string(&log)
                .map(|content| content.lines().count() >= 5)
                .unwrap_or(false)
        }),
        "service was not respawned enough times"
    );
    manager.stop(&["flaky".to_string()]).expect("stop");

    let stamps: Vec<u128> = fs::read_to_string(&log)
        .expect("attempt log")
        .lines()
        .take(5)
        .map(|line| line.trim().parse().expect("nanosecond stamp"))
        .collect();
    let intervals: Vec<Duration> = stamps
        .windows(2)
        .map(|pair| Duration::from_nanos((pair[1] - pair[0]) as u64))
        .collect();

    // Expected delays: 150, 300, 600 (limit), 600 ms. Spawn overhead and
    // reap latency only ever push the interval up.
    let expected = [150u64, 300, 600, 600];
    for (interval, expected_ms) in intervals.iter().zip(expected) {
        let lower = Duration::from_millis(expected_ms - 30);
        let upper = Duration::from_millis(expected_ms + 400);
        assert!(
            *interval >= lower && *interval <= upper,
            "interval {interval:?} outside [{lower:?}, {upper:?}]"
        );
    }
}

#[test]
fn sigterm_immune_service_is_escalated_to_sigkill() {
    let service = Service {
        name: "stubborn".to_string(),
        command: "sh -c \"trap '' TERM; while true; do sleep 0.2; done\"".to_string(),
        kill_delay: OptionalDuration::new(Duration::from_millis(300)),
        ..Service::default()
    };

    let manager = manager();
    manager.plan_changed(&plan_with(vec![service]));
    manager.start(&["stubborn".to_string()]).expect("start");

    let begun = Instant::now();
    manager.stop(&["stubborn".to_string()]).expect("stop");
    let elapsed = begun.elapsed();

    assert_eq!(status_of(&manager, "stubborn"), ServiceStatus::Stopped);
    assert!(
        elapsed >= Duration::from_millis(300),
        "stop returned before the kill delay: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(10),
        "kill escalation did not terminate the service: {elapsed:?}"
    );
}

#[test]
fn ignored_success_leaves_the_service_exited() {
    let service = Service {
        name: "oneshot".to_string(),
        // Runs past the grace window, then exits cleanly.
        command: "sleep 1.5".to_string(),
        on_success: ServiceAction::Ignore,
        ..Service::default()
    };

    let manager = manager();
    manager.plan_changed(&plan_with(vec![service]));
    manager.start(&["oneshot".to_string()]).expect("start");
    assert_eq!(status_of(&manager, "oneshot"), ServiceStatus::Running);

    assert!(
        wait_until(Duration::from_secs(5), || {
            status_of(&manager, "oneshot") == ServiceStatus::Exited
        }),
        "service did not settle in exited"
    );
}

#[test]
fn clean_exit_restarts_by_default() {
    let temp = tempdir().expect("tempdir");
    let log = temp.path().join("runs");

    let service = Service {
        name: "cycler".to_string(),
        command: format!("sh -c \"echo run >> {}; sleep 1.2\"", log.display()),
        backoff_delay: OptionalDuration::new(Duration::from_millis(50)),
        ..Service::default()
    };

    let manager = manager();
    manager.plan_changed(&plan_with(vec![service]));
    manager.start(&["cycler".to_string()]).expect("start");

    assert!(
        wait_until(Duration::from_secs(10), || {
            fs::read_to_string(&log)
                .map(|content| content.lines().count() >= 2)
                .unwrap_or(false)
        }),
        "unset on-success did not restart the service"
    );
    manager.stop(&["cycler".to_string()]).expect("stop");
}

#[test]
fn restart_replaces_the_process() {
    let manager = manager();
    let service = Service {
        name: "svc".to_string(),
        command: "sleep 60".to_string(),
        ..Service::default()
    };
    manager.plan_changed(&plan_with(vec![service]));

    manager.start(&["svc".to_string()]).expect("start");
    let first_pid = manager.services()[0].pid.expect("pid");

    manager.restart(&["svc".to_string()]).expect("restart");
    let second_pid = manager.services()[0].pid.expect("pid");

    assert_ne!(first_pid, second_pid);
    assert_eq!(status_of(&manager, "svc"), ServiceStatus::Running);
    manager.stop(&["svc".to_string()]).expect("stop");
}
