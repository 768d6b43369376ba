//! Daemon composition and lifecycle.
//!
//! Wires the reaper, plan store, service manager, check manager, and exec
//! engine together: plan updates fan out to both managers, check failures
//! feed back into service supervision, and a service `shutdown` action
//! (or a delivered signal) unwinds the whole daemon in order.

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        mpsc::{Receiver, Sender, channel},
    },
};

use tracing::{info, warn};

use crate::{
    changelog::{MemoryChangeSink, SharedSink},
    checks::CheckManager,
    error::WardenError,
    exec::ExecManager,
    reaper::Reaper,
    store::PlanStore,
    supervisor::ServiceManager,
};

/// Construction parameters for a [`Daemon`].
pub struct DaemonOptions {
    /// Directory holding the `layers/` configuration.
    pub dir: PathBuf,
    /// Change sink; defaults to an in-memory sink.
    pub sink: Option<SharedSink>,
    /// Externally owned reaper; the daemon creates and starts its own
    /// when absent. There must only ever be one reap loop per process.
    pub reaper: Option<Arc<Reaper>>,
}

/// The assembled supervisor daemon.
pub struct Daemon {
    dir: PathBuf,
    reaper: Arc<Reaper>,
    owns_reaper: bool,
    store: Arc<PlanStore>,
    services: Arc<ServiceManager>,
    checks: Arc<CheckManager>,
    execs: Arc<ExecManager>,
    shutdown_tx: Sender<()>,
    shutdown_rx: Mutex<Option<Receiver<()>>>,
}

impl Daemon {
    /// Builds the daemon and wires its components. Nothing runs until
    /// [`Daemon::start`].
    pub fn new(options: DaemonOptions) -> Arc<Self> {
        let owns_reaper = options.reaper.is_none();
        let reaper = options.reaper.unwrap_or_else(|| Arc::new(Reaper::new()));
        let sink: SharedSink = options
            .sink
            .unwrap_or_else(|| Arc::new(MemoryChangeSink::new()));

        let store = Arc::new(PlanStore::new());
        let services = ServiceManager::new(Arc::clone(&reaper), Arc::clone(&sink));
        let checks = CheckManager::new(Arc::clone(&reaper), Arc::clone(&sink));
        let execs = ExecManager::new(Arc::clone(&reaper));

        // Check failures feed back into service supervision.
        let failure_target = Arc::clone(&services);
        checks.notify_check_failed(Arc::new(move |check_name| {
            failure_target.check_failed(check_name);
        }));

        // Both managers reconfigure themselves on every plan publication.
        let services_sub = Arc::clone(&services);
        store.subscribe(Box::new(move |plan| services_sub.plan_changed(plan)));
        let checks_sub = Arc::clone(&checks);
        store.subscribe(Box::new(move |plan| checks_sub.plan_changed(plan)));

        let (shutdown_tx, shutdown_rx) = channel();
        let action_tx = shutdown_tx.clone();
        services.on_shutdown(Box::new(move || {
            let _ = action_tx.send(());
        }));

        Arc::new(Self {
            dir: options.dir,
            reaper,
            owns_reaper,
            store,
            services,
            checks,
            execs,
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
        })
    }

    /// Starts the reaper, loads and publishes the plan, and autostarts
    /// enabled services.
    pub fn start(&self) -> Result<(), WardenError> {
        if !self.reaper.is_running() {
            self.reaper.start()?;
        }

        self.store.load(&self.dir)?;

        match self.services.replan() {
            Ok(Some(change)) => info!("autostart completed (change {change})"),
            Ok(None) => info!("no services to autostart"),
            // A service stuck in backoff is the supervisor's business now;
            // the daemon keeps running.
            Err(err) => warn!("autostart did not complete: {err}"),
        }
        Ok(())
    }

    /// Blocks until a shutdown is requested, then tears everything down.
    pub fn run(&self) -> Result<(), WardenError> {
        self.start()?;
        let receiver = self
            .shutdown_rx
            .lock()
            .unwrap()
            .take()
            .expect("run may only be called once");
        let _ = receiver.recv();
        info!("shutting down");
        self.stop();
        Ok(())
    }

    /// Requests an orderly shutdown; safe to call from a signal handler
    /// thread.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Stops services in stop order, then the checks, then the reaper
    /// (only when the daemon created it).
    pub fn stop(&self) {
        self.services.stop_all();
        self.checks.stop();
        if self.owns_reaper {
            self.reaper.stop();
        }
    }

    /// Reloads the layer directory and republishes the plan.
    pub fn reload(&self) -> Result<(), WardenError> {
        self.store.load(&self.dir)?;
        Ok(())
    }

    /// The plan store.
    pub fn store(&self) -> &Arc<PlanStore> {
        &self.store
    }

    /// The service manager.
    pub fn services(&self) -> &Arc<ServiceManager> {
        &self.services
    }

    /// The check manager.
    pub fn checks(&self) -> &Arc<CheckManager> {
        &self.checks
    }

    /// The exec engine.
    pub fn execs(&self) -> &Arc<ExecManager> {
        &self.execs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Startup;
    use crate::reaper::test_reaper;
    use crate::supervisor::ServiceStatus;
    use std::fs;
    use tempfile::tempdir;

    fn daemon_in(dir: &std::path::Path) -> Arc<Daemon> {
        Daemon::new(DaemonOptions {
            dir: dir.to_path_buf(),
            sink: None,
            reaper: Some(test_reaper()),
        })
    }

    #[test]
    fn start_autostarts_enabled_services() {
        let temp = tempdir().expect("tempdir");
        let layers = temp.path().join("layers");
        fs::create_dir_all(&layers).expect("layers dir");
        fs::write(
            layers.join("001-base.yaml"),
            r#"
services:
  keeper:
    override: replace
    command: "sleep 60"
    startup: enabled
  bystander:
    override: replace
    command: "sleep 60"
"#,
        )
        .expect("write layer");

        let daemon = daemon_in(temp.path());
        daemon.start().expect("start");

        let infos = daemon.services().services();
        assert_eq!(infos.len(), 2);
        let bystander = infos.iter().find(|info| info.name == "bystander").unwrap();
        assert_eq!(bystander.status, ServiceStatus::Initial);
        assert_eq!(bystander.startup, Startup::Unknown);
        let keeper = infos.iter().find(|info| info.name == "keeper").unwrap();
        assert_eq!(keeper.status, ServiceStatus::Running);

        daemon.services().stop_all();
        daemon.checks().stop();
    }

    #[test]
    fn reload_applies_new_layers() {
        let temp = tempdir().expect("tempdir");
        let layers = temp.path().join("layers");
        fs::create_dir_all(&layers).expect("layers dir");
        fs::write(
            layers.join("001-base.yaml"),
            "services:\n  one:\n    override: replace\n    command: \"sleep 60\"\n",
        )
        .expect("write layer");

        let daemon = daemon_in(temp.path());
        daemon.start().expect("start");
        assert_eq!(daemon.services().services().len(), 1);

        fs::write(
            layers.join("002-more.yaml"),
            "services:\n  two:\n    override: replace\n    command: \"sleep 60\"\n",
        )
        .expect("write layer");
        daemon.reload().expect("reload");
        assert_eq!(daemon.services().services().len(), 2);

        daemon.services().stop_all();
        daemon.checks().stop();
    }
}
