//! Process-wide child reaper.
//!
//! The daemon registers itself as a child subreaper so that orphaned
//! grandchildren reparent to it instead of PID 1. A dedicated thread
//! consumes SIGCHLD, drains `waitpid(-1, WNOHANG)`, and hands each exit
//! code to the waiter registered for that PID. Registration happens under
//! the same mutex that guards delivery, and [`Reaper::spawn`] registers
//! while holding it, so an exit can never be reaped before its waiter
//! exists.
//!
//! Start the reaper before spawning any other threads: SIGCHLD is blocked
//! on the calling thread and inherited by threads created afterwards.

use std::{
    collections::HashMap,
    io,
    process::{Child, Command},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, SyncSender, sync_channel},
    },
    thread,
    time::Duration,
};

use nix::sys::{
    signal::{SigSet, Signal},
    wait::{WaitPidFlag, WaitStatus, waitpid},
};
use tracing::{debug, error};

use crate::error::ReaperError;

/// How long the reap loop sleeps in `sigtimedwait` before polling anyway.
/// The timeout doubles as the quit-check cadence and covers signals that
/// were discarded by threads not blocking SIGCHLD.
const SIGCHLD_WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// Receives the exit code of one spawned child, exactly once.
#[derive(Debug)]
pub struct ExitWatcher {
    pid: i32,
    rx: Receiver<i32>,
}

impl ExitWatcher {
    /// The PID being watched.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Blocks until the child exits. Returns `None` only if the reaper
    /// stopped before the exit was reaped.
    pub fn wait(&self) -> Option<i32> {
        self.rx.recv().ok()
    }

    /// Waits up to `timeout` for the exit code. `None` means the child has
    /// not exited yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        self.rx.recv_timeout(timeout).ok()
    }
}

#[derive(Default)]
struct WaiterTable {
    pending: HashMap<i32, SyncSender<i32>>,
}

/// Process-wide child subreaper. One instance per daemon.
pub struct Reaper {
    running: AtomicBool,
    quit: Arc<AtomicBool>,
    waiters: Arc<Mutex<WaiterTable>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new()
    }
}

impl Reaper {
    /// Creates a stopped reaper.
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            quit: Arc::new(AtomicBool::new(false)),
            waiters: Arc::new(Mutex::new(WaiterTable::default())),
            thread: Mutex::new(None),
        }
    }

    /// Registers the process as a child subreaper and starts the reap loop.
    #[cfg(target_os = "linux")]
    pub fn start(&self) -> Result<(), ReaperError> {
        if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } != 0 {
            return Err(ReaperError::Unsupported(
                io::Error::last_os_error().to_string(),
            ));
        }

        let mut sigchld = SigSet::empty();
        sigchld.add(Signal::SIGCHLD);
        if let Err(err) = sigchld.thread_block() {
            return Err(ReaperError::Unsupported(err.to_string()));
        }

        self.quit.store(false, Ordering::SeqCst);
        let quit = Arc::clone(&self.quit);
        let waiters = Arc::clone(&self.waiters);
        let handle = thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || reap_loop(quit, waiters))
            .map_err(|err| ReaperError::Unsupported(err.to_string()))?;

        *self.thread.lock().unwrap() = Some(handle);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// The platform cannot reparent orphans to this process; the daemon
    /// cannot run without that.
    #[cfg(not(target_os = "linux"))]
    pub fn start(&self) -> Result<(), ReaperError> {
        Err(ReaperError::Unsupported(
            "child subreaper is not supported on this platform".to_string(),
        ))
    }

    /// Whether the reap loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns `cmd` and registers an exit waiter for it in one step.
    ///
    /// Registering a second waiter for a live PID is an error; spawning
    /// through a stopped reaper is an error.
    pub fn spawn(&self, cmd: &mut Command) -> Result<(Child, ExitWatcher), ReaperError> {
        if !self.is_running() {
            return Err(ReaperError::NotStarted);
        }

        // Holding the waiter lock across the spawn keeps delivery from
        // running before the waiter is registered.
        let mut table = self.waiters.lock().unwrap();
        let child = cmd.spawn()?;
        let pid = child.id() as i32;
        if table.pending.contains_key(&pid) {
            return Err(ReaperError::AlreadyWaiting { pid });
        }
        let (tx, rx) = sync_channel(1);
        table.pending.insert(pid, tx);
        Ok((child, ExitWatcher { pid, rx }))
    }

    /// Blocks until the watched child exits, then releases the process
    /// handle. The PID was already reaped by the loop, so the final wait's
    /// ECHILD is expected and swallowed.
    pub fn wait_command(
        &self,
        child: &mut Child,
        watcher: &ExitWatcher,
    ) -> io::Result<i32> {
        let code = watcher
            .wait()
            .ok_or_else(|| io::Error::other("reaper stopped before child exit"))?;
        match child.wait() {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::ECHILD) => {}
            Err(err) => return Err(err),
        }
        Ok(code)
    }

    /// Stops the reap loop and joins its thread.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.quit.store(true, Ordering::SeqCst);
        // Wake the loop early; if the signal is lost the wait timeout
        // still bounds the shutdown.
        unsafe {
            libc::kill(libc::getpid(), libc::SIGCHLD);
        }
        if let Some(handle) = self.thread.lock().unwrap().take()
            && let Err(err) = handle.join()
        {
            error!("reaper thread panicked: {err:?}");
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reap_loop(quit: Arc<AtomicBool>, waiters: Arc<Mutex<WaiterTable>>) {
    while !quit.load(Ordering::SeqCst) {
        wait_for_sigchld(SIGCHLD_WAIT_TIMEOUT);
        drain_exits(&waiters);
    }
    // Final drain so late exits are not stranded in the kernel.
    drain_exits(&waiters);
}

#[cfg(target_os = "linux")]
fn wait_for_sigchld(timeout: Duration) {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    unsafe {
        libc::sigtimedwait(set.as_ref(), std::ptr::null_mut(), &ts);
    }
}

#[cfg(not(target_os = "linux"))]
fn wait_for_sigchld(timeout: Duration) {
    thread::sleep(timeout);
}

fn drain_exits(waiters: &Mutex<WaiterTable>) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                deliver(waiters, pid.as_raw(), code);
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                deliver(waiters, pid.as_raw(), 128 + signal as i32);
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => break,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                error!("cannot wait for children: {err}");
                break;
            }
        }
    }
}

fn deliver(waiters: &Mutex<WaiterTable>, pid: i32, code: i32) {
    let mut table = waiters.lock().unwrap();
    match table.pending.remove(&pid) {
        Some(tx) => {
            // The channel is buffered, so this never blocks; a dropped
            // watcher just discards the code.
            let _ = tx.send(code);
        }
        None => {
            debug!("reaped unmonitored child {pid} with exit code {code}");
        }
    }
}

/// Shared reaper for in-crate tests. Tests run threaded inside a single
/// process, and two reap loops would steal each other's exits.
#[cfg(test)]
pub(crate) fn test_reaper() -> Arc<Reaper> {
    use std::sync::OnceLock;
    static REAPER: OnceLock<Arc<Reaper>> = OnceLock::new();
    Arc::clone(REAPER.get_or_init(|| {
        let reaper = Reaper::new();
        reaper.start().expect("start test reaper");
        Arc::new(reaper)
    }))
}
