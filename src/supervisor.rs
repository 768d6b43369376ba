//! Service supervision.
//!
//! Each active service is driven by a dedicated worker thread running the
//! state machine
//!
//! ```text
//! initial -> starting -> running -> (exited | stopping)
//!                    \-> backoff -> starting ...
//! stopping -> stopped
//! ```
//!
//! Workers spawn through the [`Reaper`] so exit codes survive the daemon's
//! subreaper role, apply exponential backoff on failure, and escalate from
//! SIGTERM to SIGKILL on stop. The manager diffs plan updates, keeps an
//! entry per plan service, and applies `on-check-failure` actions reported
//! by the check manager.

use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use strum_macros::AsRefStr;
use tracing::{debug, info, warn};

use crate::{
    changelog::{ChangeId, SharedSink},
    constants::{
        DEFAULT_LANG_ENV, DEFAULT_PATH_ENV, OKAY_DELAY, POLL_INTERVAL,
        START_WAIT_SLACK, STOP_WAIT_TIMEOUT,
    },
    error::ServiceError,
    order,
    plan::{Plan, Service, ServiceAction, Startup},
    privilege,
    reaper::{ExitWatcher, Reaper},
};

/// Current position of a service in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ServiceStatus {
    /// Known to the plan but never started.
    Initial,
    /// Spawned; waiting out the startup grace window.
    Starting,
    /// Up and past the grace window.
    Running,
    /// Failed; waiting to be respawned.
    Backoff,
    /// Asked to stop; kill escalation in progress.
    Stopping,
    /// Stopped on request.
    Stopped,
    /// Exited and not coming back (action was ignore or shutdown).
    Exited,
}

impl ServiceStatus {
    /// Whether the service currently owns (or is about to own) a process.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Starting
                | ServiceStatus::Running
                | ServiceStatus::Backoff
                | ServiceStatus::Stopping
        )
    }
}

/// Point-in-time public view of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service name.
    pub name: String,
    /// Configured startup mode.
    pub startup: Startup,
    /// Current status.
    pub status: ServiceStatus,
    /// PID of the running process, if there is one.
    pub pid: Option<u32>,
}

struct ServiceState {
    config: Service,
    status: ServiceStatus,
    pid: Option<u32>,
    started_at: Option<Instant>,
    backoff_num: u32,
    last_exit: Option<i32>,
    stop_requested: bool,
}

struct ServiceEntry {
    state: Mutex<ServiceState>,
    signal: Condvar,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ServiceEntry {
    fn new(config: Service) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServiceState {
                config,
                status: ServiceStatus::Initial,
                pid: None,
                started_at: None,
                backoff_num: 0,
                last_exit: None,
                stop_requested: false,
            }),
            signal: Condvar::new(),
            worker: Mutex::new(None),
        })
    }

    fn set_status(&self, status: ServiceStatus) {
        let mut state = self.state.lock().unwrap();
        state.status = status;
        drop(state);
        self.signal.notify_all();
    }
}

/// Per-service state machines and the operations that drive them.
pub struct ServiceManager {
    reaper: Arc<Reaper>,
    sink: SharedSink,
    plan: Mutex<Arc<Plan>>,
    entries: Mutex<HashMap<String, Arc<ServiceEntry>>>,
    shutdown_handler: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl ServiceManager {
    /// Creates a manager with an empty plan.
    pub fn new(reaper: Arc<Reaper>, sink: SharedSink) -> Arc<Self> {
        Arc::new(Self {
            reaper,
            sink,
            plan: Mutex::new(Arc::new(Plan::default())),
            entries: Mutex::new(HashMap::new()),
            shutdown_handler: Mutex::new(None),
        })
    }

    /// Registers the callback invoked when a service action asks for the
    /// whole daemon to shut down.
    pub fn on_shutdown(&self, handler: Box<dyn Fn() + Send + Sync>) {
        *self.shutdown_handler.lock().unwrap() = Some(handler);
    }

    /// Applies a new plan: stops removed services, hot-updates or restarts
    /// changed ones, creates entries for new ones, and autostarts newly
    /// enabled services.
    pub fn plan_changed(self: &Arc<Self>, plan: &Arc<Plan>) {
        let old_plan = {
            let mut current = self.plan.lock().unwrap();
            std::mem::replace(&mut *current, Arc::clone(plan))
        };

        let removed: Vec<String> = {
            let entries = self.entries.lock().unwrap();
            entries
                .keys()
                .filter(|name| !plan.services.contains_key(*name))
                .cloned()
                .collect()
        };
        if !removed.is_empty() {
            let ordered = order::stop_order(&old_plan.services, &removed)
                .unwrap_or_else(|_| removed.clone());
            for name in ordered {
                if !removed.contains(&name) {
                    continue;
                }
                if let Err(err) = self.stop_one(&name, false) {
                    warn!("cannot stop removed service \"{name}\": {err}");
                }
                self.entries.lock().unwrap().remove(&name);
                debug!("dropped service \"{name}\" removed from plan");
            }
        }

        let mut added_enabled = Vec::new();
        let mut to_restart = Vec::new();
        for (name, config) in &plan.services {
            let entry = {
                let entries = self.entries.lock().unwrap();
                entries.get(name).cloned()
            };
            match entry {
                None => {
                    self.entries
                        .lock()
                        .unwrap()
                        .insert(name.clone(), ServiceEntry::new(config.clone()));
                    if config.startup == Startup::Enabled {
                        added_enabled.push(name.clone());
                    }
                }
                Some(entry) => {
                    let mut state = entry.state.lock().unwrap();
                    if state.config != *config {
                        let restart = needs_restart(&state.config, config);
                        state.config = config.clone();
                        if restart && state.status.is_active() {
                            to_restart.push(name.clone());
                        }
                    }
                }
            }
        }

        for name in to_restart {
            info!("service \"{name}\" changed in plan; restarting");
            if let Err(err) = self.restart(&[name.clone()]) {
                warn!("cannot restart changed service \"{name}\": {err}");
            }
        }

        if !added_enabled.is_empty()
            && let Err(err) = self.start(&added_enabled)
        {
            warn!("cannot autostart services: {err}");
        }
    }

    /// Starts the named services (plus everything they require) in start
    /// order. A later service's startup begins only once the earlier one
    /// reports running.
    pub fn start(self: &Arc<Self>, names: &[String]) -> Result<ChangeId, ServiceError> {
        let plan = self.current_plan();
        let ordered = order::start_order(&plan.services, names)?;

        let change = self
            .sink
            .open_change("start", &format!("Start service(s) {}", ordered.join(", ")));

        for name in &ordered {
            // Services pulled in through requires may already be up.
            if !names.contains(name) && self.status_of(name) == Some(ServiceStatus::Running)
            {
                continue;
            }
            self.sink.append_task(
                &change,
                "start",
                &format!("start service \"{name}\""),
                None,
            );
            if let Err(err) = self.start_one(name) {
                self.sink
                    .append_task(&change, "start", &err.to_string(), None);
                self.sink.close_change(&change, false);
                return Err(err);
            }
        }

        self.sink.close_change(&change, true);
        Ok(change)
    }

    /// Stops the named services (plus everything that requires them) in
    /// stop order.
    pub fn stop(&self, names: &[String]) -> Result<ChangeId, ServiceError> {
        let plan = self.current_plan();
        let ordered = order::stop_order(&plan.services, names)?;

        let change = self
            .sink
            .open_change("stop", &format!("Stop service(s) {}", ordered.join(", ")));

        for name in &ordered {
            // Only explicitly requested services must be active; dependents
            // pulled in through requires are skipped when already down.
            let strict = names.contains(name);
            self.sink.append_task(
                &change,
                "stop",
                &format!("stop service \"{name}\""),
                None,
            );
            if let Err(err) = self.stop_one(name, strict) {
                self.sink
                    .append_task(&change, "stop", &err.to_string(), None);
                self.sink.close_change(&change, false);
                return Err(err);
            }
        }

        self.sink.close_change(&change, true);
        Ok(change)
    }

    /// Stops then starts the named services.
    pub fn restart(self: &Arc<Self>, names: &[String]) -> Result<ChangeId, ServiceError> {
        let plan = self.current_plan();
        let ordered = order::stop_order(&plan.services, names)?;
        for name in &ordered {
            self.stop_one(name, false)?;
        }
        self.start(names)
    }

    /// Starts every enabled service that is not already active. Returns
    /// the change id if anything had to be started.
    pub fn replan(self: &Arc<Self>) -> Result<Option<ChangeId>, ServiceError> {
        let plan = self.current_plan();
        let mut to_start = Vec::new();
        for (name, config) in &plan.services {
            if config.startup != Startup::Enabled {
                continue;
            }
            match self.status_of(name) {
                Some(status) if status.is_active() => {}
                _ => to_start.push(name.clone()),
            }
        }
        if to_start.is_empty() {
            return Ok(None);
        }
        self.start(&to_start).map(Some)
    }

    /// Stops every active service, honoring stop order. Used on daemon
    /// shutdown.
    pub fn stop_all(&self) {
        let plan = self.current_plan();
        let active: Vec<String> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter(|(_, entry)| entry.state.lock().unwrap().status.is_active())
                .map(|(name, _)| name.clone())
                .collect()
        };
        if active.is_empty() {
            return;
        }
        let ordered =
            order::stop_order(&plan.services, &active).unwrap_or_else(|_| active.clone());
        for name in ordered {
            if let Err(err) = self.stop_one(&name, false) {
                warn!("cannot stop service \"{name}\" during shutdown: {err}");
            }
        }
    }

    /// Snapshot of all plan services, name-sorted.
    pub fn services(&self) -> Vec<ServiceInfo> {
        let plan = self.current_plan();
        let entries = self.entries.lock().unwrap();
        plan.services
            .iter()
            .map(|(name, config)| {
                let (status, pid) = entries
                    .get(name)
                    .map(|entry| {
                        let state = entry.state.lock().unwrap();
                        (state.status, state.pid)
                    })
                    .unwrap_or((ServiceStatus::Initial, None));
                ServiceInfo {
                    name: name.clone(),
                    startup: config.startup,
                    status,
                    pid,
                }
            })
            .collect()
    }

    /// Applies the per-service `on-check-failure` actions for a check that
    /// just reached its failure threshold. Registered with the check
    /// manager as its failure handler.
    pub fn check_failed(self: &Arc<Self>, check_name: &str) {
        let targets: Vec<(String, ServiceAction)> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .map(|(name, entry)| {
                    let state = entry.state.lock().unwrap();
                    (name.clone(), state.config.check_failure_action(check_name))
                })
                .collect()
        };

        for (name, action) in targets {
            match action {
                ServiceAction::Restart => {
                    info!(
                        "check \"{check_name}\" failed; restarting service \"{name}\""
                    );
                    let manager = Arc::clone(self);
                    thread::spawn(move || {
                        if let Err(err) = manager.restart(&[name.clone()]) {
                            warn!(
                                "cannot restart service \"{name}\" after check failure: {err}"
                            );
                        }
                    });
                }
                ServiceAction::Shutdown => {
                    info!(
                        "check \"{check_name}\" failed; service \"{name}\" requests shutdown"
                    );
                    self.trigger_shutdown();
                }
                ServiceAction::Ignore | ServiceAction::Unset => {}
            }
        }
    }

    fn current_plan(&self) -> Arc<Plan> {
        Arc::clone(&self.plan.lock().unwrap())
    }

    fn entry(&self, name: &str) -> Option<Arc<ServiceEntry>> {
        self.entries.lock().unwrap().get(name).cloned()
    }

    fn status_of(&self, name: &str) -> Option<ServiceStatus> {
        self.entry(name)
            .map(|entry| entry.state.lock().unwrap().status)
    }

    fn trigger_shutdown(&self) {
        if let Some(handler) = self.shutdown_handler.lock().unwrap().as_ref() {
            handler();
        } else {
            warn!("shutdown requested but no shutdown handler is registered");
        }
    }

    /// Transitions one service to starting and blocks until its worker
    /// reports running (or failure).
    fn start_one(self: &Arc<Self>, name: &str) -> Result<(), ServiceError> {
        let entry = self.entry(name).ok_or_else(|| ServiceError::NotFound {
            service: name.to_string(),
        })?;

        {
            let mut state = entry.state.lock().unwrap();
            match state.status {
                ServiceStatus::Initial
                | ServiceStatus::Stopped
                | ServiceStatus::Exited => {
                    state.status = ServiceStatus::Starting;
                    state.stop_requested = false;
                    state.backoff_num = 0;
                    state.last_exit = None;
                }
                status => {
                    return Err(ServiceError::InvalidTransition {
                        service: name.to_string(),
                        status: status.as_ref().to_string(),
                        verb: "started".to_string(),
                    });
                }
            }
        }

        // Reap a finished worker handle from a previous run before
        // installing the new one.
        if let Some(old) = self.take_worker(&entry) {
            let _ = old.join();
        }

        let manager = Arc::clone(self);
        let entry_for_worker = Arc::clone(&entry);
        let worker_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("svc-{name}"))
            .spawn(move || manager.supervise(worker_name, entry_for_worker))
            .map_err(|err| ServiceError::StartError {
                service: name.to_string(),
                source: err,
            })?;
        *entry.worker.lock().unwrap() = Some(handle);

        let deadline = OKAY_DELAY + START_WAIT_SLACK;
        let guard = entry.state.lock().unwrap();
        let (state, timeout) = entry
            .signal
            .wait_timeout_while(guard, deadline, |state| {
                state.status == ServiceStatus::Starting
            })
            .unwrap();
        match state.status {
            ServiceStatus::Running => Ok(()),
            ServiceStatus::Starting if timeout.timed_out() => {
                Err(ServiceError::WaitTimeout {
                    service: name.to_string(),
                    verb: "start".to_string(),
                })
            }
            _ => Err(ServiceError::ShortLived {
                service: name.to_string(),
                code: state.last_exit.unwrap_or(-1),
            }),
        }
    }

    /// Stops one service. With `strict`, stopping an inactive service is
    /// an error; otherwise it is a no-op.
    fn stop_one(&self, name: &str, strict: bool) -> Result<(), ServiceError> {
        let entry = self.entry(name).ok_or_else(|| ServiceError::NotFound {
            service: name.to_string(),
        })?;

        {
            let mut state = entry.state.lock().unwrap();
            match state.status {
                ServiceStatus::Starting
                | ServiceStatus::Running
                | ServiceStatus::Backoff => {
                    state.status = ServiceStatus::Stopping;
                    state.stop_requested = true;
                    let pid = state.pid;
                    drop(state);
                    entry.signal.notify_all();
                    if let Some(pid) = pid {
                        debug!("sending SIGTERM to service \"{name}\" (pid {pid})");
                        kill_group(pid, libc::SIGTERM);
                    }
                }
                ServiceStatus::Stopping => {}
                status => {
                    if strict {
                        return Err(ServiceError::InvalidTransition {
                            service: name.to_string(),
                            status: status.as_ref().to_string(),
                            verb: "stopped".to_string(),
                        });
                    }
                    return Ok(());
                }
            }
        }

        let guard = entry.state.lock().unwrap();
        let (state, timeout) = entry
            .signal
            .wait_timeout_while(guard, STOP_WAIT_TIMEOUT, |state| {
                state.status == ServiceStatus::Stopping
            })
            .unwrap();
        let stopped = matches!(
            state.status,
            ServiceStatus::Stopped | ServiceStatus::Exited
        );
        drop(state);
        if !stopped && timeout.timed_out() {
            return Err(ServiceError::WaitTimeout {
                service: name.to_string(),
                verb: "stop".to_string(),
            });
        }

        if let Some(handle) = self.take_worker(&entry) {
            let _ = handle.join();
        }
        info!("service \"{name}\" stopped");
        Ok(())
    }

    fn take_worker(&self, entry: &ServiceEntry) -> Option<thread::JoinHandle<()>> {
        entry.worker.lock().unwrap().take()
    }

    /// Worker loop: spawn, watch, classify the exit, back off, respawn.
    fn supervise(self: Arc<Self>, name: String, entry: Arc<ServiceEntry>) {
        loop {
            let config = entry.state.lock().unwrap().config.clone();

            let spawned = spawn_service(&self.reaper, &config);
            let (mut child, watcher) = match spawned {
                Ok(pair) => pair,
                Err(err) => {
                    // Spawn errors are transient: a missing binary should
                    // still drive the failure action and backoff.
                    warn!("cannot start service \"{name}\": {err}");
                    entry.state.lock().unwrap().last_exit = None;
                    let action = failure_action(&config);
                    match self.apply_exit_action(&name, &entry, &config, action) {
                        Flow::Respawn => continue,
                        Flow::Done => break,
                    }
                }
            };

            let started = Instant::now();
            {
                let mut state = entry.state.lock().unwrap();
                state.pid = Some(child.id());
                state.started_at = Some(started);
            }
            debug!("service \"{name}\" spawned with pid {}", child.id());

            let exit_code =
                self.watch_child(&name, &entry, &config, &mut child, &watcher, started);

            let ran_for = started.elapsed();
            let was_stopping = {
                let mut state = entry.state.lock().unwrap();
                let stopping = state.status == ServiceStatus::Stopping;
                state.pid = None;
                state.started_at = None;
                state.last_exit = Some(exit_code);
                if ran_for >= config.effective_backoff_limit() {
                    // A run longer than the reset window starts the
                    // backoff series over.
                    state.backoff_num = 0;
                }
                stopping
            };

            if was_stopping {
                entry.set_status(ServiceStatus::Stopped);
                break;
            }
            let action = if ran_for < OKAY_DELAY {
                // An exit inside the grace window is a failed start no
                // matter what the exit code was.
                warn!(
                    "service \"{name}\" exited too quickly with code {exit_code} after {ran_for:?}"
                );
                failure_action(&config)
            } else if exit_code == 0 {
                info!("service \"{name}\" exited cleanly");
                success_action(&config)
            } else {
                warn!("service \"{name}\" exited unexpectedly with code {exit_code}");
                failure_action(&config)
            };

            match self.apply_exit_action(&name, &entry, &config, action) {
                Flow::Respawn => continue,
                Flow::Done => break,
            }
        }
    }

    /// Watches a spawned child until it exits, announcing "running" after
    /// the grace window and escalating SIGTERM to SIGKILL while stopping.
    fn watch_child(
        &self,
        name: &str,
        entry: &ServiceEntry,
        config: &Service,
        child: &mut Child,
        watcher: &ExitWatcher,
        started: Instant,
    ) -> i32 {
        let okay_deadline = started + OKAY_DELAY;
        let mut announced = false;
        let mut kill_deadline: Option<Instant> = None;
        loop {
            if let Some(code) = watcher.wait_timeout(POLL_INTERVAL) {
                // The reap loop already collected the exit; the final wait
                // only releases the handle, so ECHILD is expected.
                match child.wait() {
                    Ok(_) => {}
                    Err(err) if err.raw_os_error() == Some(libc::ECHILD) => {}
                    Err(err) => warn!("cannot release service \"{name}\" handle: {err}"),
                }
                return code;
            }

            let state = entry.state.lock().unwrap();
            let status = state.status;
            let pid = state.pid;
            drop(state);

            if status == ServiceStatus::Stopping {
                match kill_deadline {
                    None => {
                        kill_deadline =
                            Some(Instant::now() + config.effective_kill_delay());
                    }
                    Some(deadline) if Instant::now() >= deadline => {
                        if let Some(pid) = pid {
                            warn!(
                                "service \"{name}\" did not stop after SIGTERM; sending SIGKILL"
                            );
                            kill_group(pid, libc::SIGKILL);
                        }
                        // Push the deadline out; SIGKILL cannot be refused.
                        kill_deadline = Some(Instant::now() + STOP_WAIT_TIMEOUT);
                    }
                    Some(_) => {}
                }
            } else if !announced && Instant::now() >= okay_deadline {
                announced = true;
                entry.set_status(ServiceStatus::Running);
                info!(
                    "service \"{name}\" is running (pid {})",
                    pid.unwrap_or_default()
                );
            }
        }
    }

    /// Applies the configured exit action, sleeping out the backoff when
    /// the action is a restart.
    fn apply_exit_action(
        &self,
        name: &str,
        entry: &ServiceEntry,
        config: &Service,
        action: ServiceAction,
    ) -> Flow {
        match action {
            ServiceAction::Restart | ServiceAction::Unset => {
                let delay = {
                    let mut state = entry.state.lock().unwrap();
                    state.backoff_num += 1;
                    state.status = ServiceStatus::Backoff;
                    backoff_delay(config, state.backoff_num)
                };
                entry.signal.notify_all();
                info!(
                    "service \"{name}\" will restart in {}",
                    humantime::format_duration(delay)
                );
                if self.backoff_sleep(entry, delay) {
                    entry.set_status(ServiceStatus::Starting);
                    Flow::Respawn
                } else {
                    // Stop requested mid-backoff.
                    entry.set_status(ServiceStatus::Stopped);
                    Flow::Done
                }
            }
            ServiceAction::Shutdown => {
                info!("service \"{name}\" action is shutdown; stopping the daemon");
                entry.set_status(ServiceStatus::Exited);
                self.trigger_shutdown();
                Flow::Done
            }
            ServiceAction::Ignore => {
                entry.set_status(ServiceStatus::Exited);
                Flow::Done
            }
        }
    }

    /// Sleeps for `delay`, waking early when a stop arrives. Returns false
    /// if the sleep was cancelled.
    fn backoff_sleep(&self, entry: &ServiceEntry, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            {
                let state = entry.state.lock().unwrap();
                if state.stop_requested || state.status == ServiceStatus::Stopping {
                    return false;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

enum Flow {
    Respawn,
    Done,
}

fn success_action(config: &Service) -> ServiceAction {
    match config.on_success {
        ServiceAction::Unset => ServiceAction::Restart,
        action => action,
    }
}

fn failure_action(config: &Service) -> ServiceAction {
    match config.on_failure {
        ServiceAction::Unset => ServiceAction::Restart,
        action => action,
    }
}

/// Fields whose change requires respawning the process. Everything else
/// (ordering relations, exit actions, backoff tuning, check reactions) is
/// hot-updated in place.
fn needs_restart(old: &Service, new: &Service) -> bool {
    old.command != new.command
        || old.environment != new.environment
        || old.user_id != new.user_id
        || old.user != new.user
        || old.group_id != new.group_id
        || old.group != new.group
        || old.working_dir != new.working_dir
}

/// Computes `min(delay * factor^(n-1), limit)` without overflowing.
fn backoff_delay(config: &Service, backoff_num: u32) -> Duration {
    let base = config.effective_backoff_delay().as_secs_f64();
    let factor = config.effective_backoff_factor();
    let limit = config.effective_backoff_limit();
    let scaled = base * factor.powi(backoff_num.saturating_sub(1) as i32);
    if !scaled.is_finite() || scaled >= limit.as_secs_f64() {
        return limit;
    }
    Duration::from_secs_f64(scaled).min(limit)
}

/// Builds and spawns the service process per the spawn contract: resolved
/// identity, plan environment over PATH/LANG/HOME/USER defaults, working
/// directory falling back to HOME then "/", and a fresh session.
fn spawn_service(
    reaper: &Reaper,
    config: &Service,
) -> Result<(Child, ExitWatcher), ServiceError> {
    let service = config.name.clone();
    let wrap = |source: io::Error| ServiceError::StartError {
        service: service.clone(),
        source,
    };

    let (base, extra) = config
        .command_args()
        .map_err(|err| wrap(io::Error::other(err.to_string())))?;
    let mut args = base;
    args.extend(extra);

    let identity = privilege::normalize_ids(
        config.user_id,
        &config.user,
        config.group_id,
        &config.group,
    )
    .map_err(|err| wrap(err))?;
    let uid = identity
        .map(|identity| identity.uid)
        .unwrap_or_else(|| privilege::current_identity().uid);

    let mut environment: HashMap<String, String> = config
        .environment
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    environment
        .entry("PATH".to_string())
        .or_insert_with(|| DEFAULT_PATH_ENV.to_string());
    environment
        .entry("LANG".to_string())
        .or_insert_with(|| DEFAULT_LANG_ENV.to_string());
    for (key, value) in privilege::user_environment(uid) {
        environment.entry(key).or_insert(value);
    }

    let cwd = if config.working_dir.is_empty() {
        environment
            .get("HOME")
            .map(PathBuf::from)
            .filter(|home| home.is_dir())
            .unwrap_or_else(|| PathBuf::from("/"))
    } else {
        PathBuf::from(&config.working_dir)
    };

    let mut cmd = Command::new(&args[0]);
    cmd.args(&args[1..])
        .env_clear()
        .envs(&environment)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(move || {
            // A fresh session keeps daemon-directed signals away from the
            // service and gives the process group its own id for kills.
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if let Some(identity) = identity {
                privilege::apply_identity(identity)?;
            }
            Ok(())
        });
    }

    reaper
        .spawn(&mut cmd)
        .map_err(|err| wrap(io::Error::other(err.to_string())))
}

/// Signals the whole process group, falling back to the single process if
/// group delivery is refused.
pub(crate) fn kill_group(pid: u32, signal: i32) {
    unsafe {
        if libc::killpg(pid as i32, signal) == -1 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::ESRCH => {}
                _ => {
                    let _ = libc::kill(pid as i32, signal);
                }
            }
        }
    }
}
