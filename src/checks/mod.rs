//! Health check engine.
//!
//! Each configured check runs on its own thread: tick, probe with a
//! deadline, account the result. A check goes down when its consecutive
//! failure count reaches the threshold, at which point the registered
//! failure callbacks fire exactly once; a later success resets the count
//! and re-arms them. Failures are recorded through the [`ChangeSink`] as a
//! "recover-check" change so the operator can see what went wrong.

pub mod probes;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError, Sender, channel},
    },
    thread,
};

use strum_macros::AsRefStr;
use tracing::{debug, info};

use crate::{
    changelog::{CHECK_FAILURE_KIND, ChangeId, RECOVER_CHECK_KIND, SharedSink},
    plan::{Check, CheckLevel, Plan},
    reaper::Reaper,
};

use probes::Checker;

/// Whether a check is currently passing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum CheckStatus {
    /// Below the failure threshold.
    Up,
    /// At or beyond the failure threshold.
    Down,
}

/// Point-in-time public view of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckInfo {
    /// Check name.
    pub name: String,
    /// Configured level.
    pub level: CheckLevel,
    /// Up or down.
    pub status: CheckStatus,
    /// Current consecutive failure count.
    pub failures: u32,
    /// Failures required to go down.
    pub threshold: u32,
    /// Open recover change, if the check is failing.
    pub change_id: Option<ChangeId>,
    /// Message from the most recent failure.
    pub last_error: Option<String>,
}

/// Callback fired when a check first reaches its threshold.
pub type FailureCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct CheckState {
    config: Check,
    failures: u32,
    latched: bool,
    last_error: Option<String>,
    change: Option<ChangeId>,
}

struct CheckHandle {
    state: Arc<Mutex<CheckState>>,
    quit: Sender<()>,
    cancelled: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

/// Owns the per-check runtimes and their threshold accounting.
pub struct CheckManager {
    reaper: Arc<Reaper>,
    sink: SharedSink,
    checks: Mutex<HashMap<String, CheckHandle>>,
    callbacks: Arc<Mutex<Vec<FailureCallback>>>,
}

impl CheckManager {
    /// Creates a manager with no checks.
    pub fn new(reaper: Arc<Reaper>, sink: SharedSink) -> Arc<Self> {
        Arc::new(Self {
            reaper,
            sink,
            checks: Mutex::new(HashMap::new()),
            callbacks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Registers a callback invoked with the check name whenever a check
    /// first reaches its failure threshold.
    pub fn notify_check_failed(&self, callback: FailureCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Replaces all check runtimes with the plan's checks. Prior runtimes
    /// are stopped to completion (cancelling any in-flight probe) before
    /// the new ones start.
    pub fn plan_changed(&self, plan: &Arc<Plan>) {
        let mut checks = self.checks.lock().unwrap();
        stop_handles(&mut checks);
        for (name, config) in &plan.checks {
            checks.insert(name.clone(), self.start_check(config.clone()));
        }
        debug!("check manager now runs {} check(s)", checks.len());
    }

    /// Stops all check runtimes.
    pub fn stop(&self) {
        let mut checks = self.checks.lock().unwrap();
        stop_handles(&mut checks);
    }

    /// Snapshot of checks matching the filters, name-sorted. A level
    /// filter of `alive` also matches `ready` checks; unset matches all.
    /// An empty name list matches all names.
    pub fn checks(&self, level: CheckLevel, names: &[String]) -> Vec<CheckInfo> {
        let checks = self.checks.lock().unwrap();
        let mut infos: Vec<CheckInfo> = checks
            .iter()
            .filter(|(name, handle)| {
                let config_level = handle.state.lock().unwrap().config.level;
                include_level(level, config_level)
                    && (names.is_empty() || names.contains(name))
            })
            .map(|(name, handle)| {
                let state = handle.state.lock().unwrap();
                let threshold = state.config.effective_threshold();
                CheckInfo {
                    name: name.clone(),
                    level: state.config.level,
                    status: if state.failures >= threshold {
                        CheckStatus::Down
                    } else {
                        CheckStatus::Up
                    },
                    failures: state.failures,
                    threshold,
                    change_id: state.change.clone(),
                    last_error: state.last_error.clone(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn start_check(&self, config: Check) -> CheckHandle {
        let name = config.name.clone();
        let probe = probes::new_checker(&config, Arc::clone(&self.reaper));
        let state = Arc::new(Mutex::new(CheckState {
            config,
            failures: 0,
            latched: false,
            last_error: None,
            change: None,
        }));

        let (quit_tx, quit_rx) = channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let loop_state = Arc::clone(&state);
        let loop_cancelled = Arc::clone(&cancelled);
        let sink = Arc::clone(&self.sink);
        let callbacks = Arc::clone(&self.callbacks);
        let worker = thread::Builder::new()
            .name(format!("check-{name}"))
            .spawn(move || {
                check_loop(name, loop_state, probe, quit_rx, loop_cancelled, sink, callbacks)
            })
            .expect("spawn check thread");

        CheckHandle {
            state,
            quit: quit_tx,
            cancelled,
            worker: Some(worker),
        }
    }
}

/// Level filter semantics: unset matches everything, and a query for
/// alive also accepts ready checks (a ready workload is alive).
fn include_level(filter: CheckLevel, level: CheckLevel) -> bool {
    match filter {
        CheckLevel::Unset => true,
        CheckLevel::Alive => matches!(level, CheckLevel::Alive | CheckLevel::Ready),
        CheckLevel::Ready => level == CheckLevel::Ready,
    }
}

fn stop_handles(checks: &mut HashMap<String, CheckHandle>) {
    for (name, mut handle) in checks.drain() {
        handle.cancelled.store(true, Ordering::SeqCst);
        let _ = handle.quit.send(());
        if let Some(worker) = handle.worker.take()
            && worker.join().is_err()
        {
            debug!("check \"{name}\" worker panicked");
        }
    }
}

fn check_loop(
    name: String,
    state: Arc<Mutex<CheckState>>,
    probe: Box<dyn Checker>,
    quit: Receiver<()>,
    cancelled: Arc<AtomicBool>,
    sink: SharedSink,
    callbacks: Arc<Mutex<Vec<FailureCallback>>>,
) {
    let (period, timeout, threshold) = {
        let state = state.lock().unwrap();
        (
            state.config.effective_period(),
            state.config.effective_timeout(),
            state.config.effective_threshold(),
        )
    };

    loop {
        match quit.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let result = probe.check(timeout, &cancelled);

        // Teardown cancellation: whatever the probe returned, it did not
        // run to completion on its own terms. Nothing is counted, no
        // change is recorded, no action fires.
        if cancelled.load(Ordering::SeqCst) {
            break;
        }

        match result {
            Ok(()) => {
                let closed = {
                    let mut state = state.lock().unwrap();
                    let was_down = state.failures >= threshold;
                    state.failures = 0;
                    state.latched = false;
                    state.last_error = None;
                    state.change.take().map(|change| (change, was_down))
                };
                if let Some((change, was_down)) = closed {
                    if was_down {
                        info!("check \"{name}\" recovered");
                    }
                    sink.close_change(&change, true);
                }
            }
            Err(err) => {
                let (failures, fire, change) = {
                    let mut state = state.lock().unwrap();
                    state.failures += 1;
                    state.last_error = Some(err.message.clone());
                    let change = state
                        .change
                        .get_or_insert_with(|| {
                            sink.open_change(
                                RECOVER_CHECK_KIND,
                                &format!("Recover check \"{name}\""),
                            )
                        })
                        .clone();
                    let fire = !state.latched && state.failures >= threshold;
                    if fire {
                        state.latched = true;
                    }
                    (state.failures, fire, change)
                };

                info!(
                    "check \"{name}\" failure {failures}/{threshold}: {}",
                    err.message
                );
                sink.append_task(
                    &change,
                    CHECK_FAILURE_KIND,
                    &err.message,
                    err.details.as_deref(),
                );

                if fire {
                    info!(
                        "check \"{name}\" reached failure threshold {threshold}; running actions"
                    );
                    let snapshot: Vec<FailureCallback> =
                        callbacks.lock().unwrap().clone();
                    for callback in snapshot {
                        callback(&name);
                    }
                }
            }
        }
    }
}
