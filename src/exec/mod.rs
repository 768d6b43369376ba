//! One-shot command execution with bidirectional streaming.
//!
//! An exec request allocates opaque stream identifiers for its channels
//! (stdio, optional stderr, control), waits for the peers to attach, runs
//! the child with pipes or a PTY, mirrors bytes between the child and the
//! streams, and applies control commands (resize, signal) while the child
//! runs. Exit codes are collected through the [`Reaper`] like any other
//! supervised process.

pub mod control;
pub mod streams;

use std::{
    collections::HashMap,
    fmt,
    fs::File,
    io::{self, Read, Write},
    os::fd::{AsRawFd, OwnedFd},
    path::PathBuf,
    process::{Command, Stdio},
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use nix::pty::{Winsize, openpty};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    constants::{
        DEFAULT_LANG_ENV, DEFAULT_PATH_ENV, EXEC_ATTACH_TIMEOUT,
        EXEC_UNKNOWN_EXIT_CODE, POLL_INTERVAL,
    },
    error::ExecError,
    privilege::{self, Identity},
    reaper::Reaper,
    supervisor::kill_group,
};

pub use streams::{ChannelStream, ExecStream, StreamError, StreamFrame, stream_pair};

/// Logical channel of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKey {
    /// JSON control commands.
    Control,
    /// Combined stdin/stdout (and stderr unless split).
    Stdio,
    /// Separate stderr, present only when requested.
    Stderr,
}

impl StreamKey {
    /// Wire name of the channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKey::Control => "control",
            StreamKey::Stdio => "stdio",
            StreamKey::Stderr => "stderr",
        }
    }
}

/// Parameters of an exec request.
#[derive(Debug, Clone, Default)]
pub struct ExecArgs {
    /// Command and arguments. Not shell-interpreted.
    pub command: Vec<String>,
    /// Extra environment; service-spawn defaults fill the gaps.
    pub environment: HashMap<String, String>,
    /// Working directory; defaults like a service (HOME, then "/").
    pub working_dir: Option<String>,
    /// Wall-clock bound on the child. Elapsing it kills the child.
    pub timeout: Option<Duration>,
    /// Numeric user ID to run as.
    pub user_id: Option<u32>,
    /// User name to run as.
    pub user: String,
    /// Numeric group ID to run as.
    pub group_id: Option<u32>,
    /// Group name to run as.
    pub group: String,
    /// Allocate a PTY and run the child with a controlling terminal.
    pub use_terminal: bool,
    /// Deliver stderr on its own stream instead of merging into stdio.
    pub split_stderr: bool,
    /// Initial terminal width, if `use_terminal`.
    pub width: u16,
    /// Initial terminal height, if `use_terminal`.
    pub height: u16,
}

/// What a caller needs to attach to an execution.
#[derive(Debug, Clone)]
pub struct ExecMetadata {
    /// Opaque stream id per channel name.
    pub stream_ids: HashMap<String, String>,
    /// Fully resolved child environment.
    pub environment: HashMap<String, String>,
    /// Fully resolved working directory.
    pub working_dir: PathBuf,
}

/// One-shot signal latch.
#[derive(Default, Debug)]
struct OneShot {
    fired: Mutex<bool>,
    signal: Condvar,
}

impl OneShot {
    fn fire(&self) {
        *self.fired.lock().unwrap() = true;
        self.signal.notify_all();
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.fired.lock().unwrap();
        let (guard, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |fired| !*fired)
            .unwrap();
        *guard
    }
}

/// One pending or running execution.
pub struct Execution {
    command: Vec<String>,
    environment: HashMap<String, String>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
    identity: Option<Identity>,
    use_terminal: bool,
    split_stderr: bool,
    width: u16,
    height: u16,
    stream_ids: HashMap<StreamKey, String>,
    attached: Mutex<HashMap<StreamKey, Arc<dyn ExecStream>>>,
    io_ready: OneShot,
    control_ready: OneShot,
    done: OneShot,
    child_pid: Mutex<Option<u32>>,
    exit_code: Mutex<Option<i32>>,
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("command", &self.command)
            .field("environment", &self.environment)
            .field("working_dir", &self.working_dir)
            .field("timeout", &self.timeout)
            .field("identity", &self.identity)
            .field("use_terminal", &self.use_terminal)
            .field("split_stderr", &self.split_stderr)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stream_ids", &self.stream_ids)
            .field(
                "attached",
                &self.attached.lock().unwrap().keys().collect::<Vec<_>>(),
            )
            .field("io_ready", &self.io_ready)
            .field("control_ready", &self.control_ready)
            .field("done", &self.done)
            .field("child_pid", &self.child_pid)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

impl Execution {
    /// The opaque id of one of this execution's streams.
    pub fn stream_id(&self, key: StreamKey) -> Option<&str> {
        self.stream_ids.get(&key).map(String::as_str)
    }

    /// Attach metadata handed back to the requesting client.
    pub fn metadata(&self) -> ExecMetadata {
        ExecMetadata {
            stream_ids: self
                .stream_ids
                .iter()
                .map(|(key, id)| (key.as_str().to_string(), id.clone()))
                .collect(),
            environment: self.environment.clone(),
            working_dir: self.working_dir.clone(),
        }
    }

    /// Exit code, once the child has finished. Signal deaths read as
    /// 128 plus the signal number; timeouts as -1.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }

    fn stream(&self, key: StreamKey) -> Option<Arc<dyn ExecStream>> {
        self.attached.lock().unwrap().get(&key).cloned()
    }

    fn io_attached(&self) -> bool {
        let attached = self.attached.lock().unwrap();
        attached.contains_key(&StreamKey::Stdio)
            && (!self.split_stderr || attached.contains_key(&StreamKey::Stderr))
    }
}

/// Accepts exec requests and runs them.
pub struct ExecManager {
    reaper: Arc<Reaper>,
    registry: Mutex<HashMap<String, (Arc<Execution>, StreamKey)>>,
    counter: AtomicU64,
}

impl ExecManager {
    /// Creates a manager with no executions.
    pub fn new(reaper: Arc<Reaper>) -> Arc<Self> {
        Arc::new(Self {
            reaper,
            registry: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        })
    }

    /// Validates a request, resolves its environment and working
    /// directory like a service spawn, and allocates its stream ids.
    pub fn exec(&self, args: ExecArgs) -> Result<Arc<Execution>, ExecError> {
        if args.command.is_empty() || args.command[0].is_empty() {
            return Err(ExecError::BadRequest("must specify command".to_string()));
        }

        let identity =
            privilege::normalize_ids(args.user_id, &args.user, args.group_id, &args.group)
                .map_err(|err| ExecError::BadRequest(err.to_string()))?;
        let uid = identity
            .map(|identity| identity.uid)
            .unwrap_or_else(|| privilege::current_identity().uid);

        let mut environment = args.environment.clone();
        environment
            .entry("PATH".to_string())
            .or_insert_with(|| DEFAULT_PATH_ENV.to_string());
        environment
            .entry("LANG".to_string())
            .or_insert_with(|| DEFAULT_LANG_ENV.to_string());
        for (key, value) in privilege::user_environment(uid) {
            environment.entry(key).or_insert(value);
        }
        if args.use_terminal {
            environment
                .entry("TERM".to_string())
                .or_insert_with(|| "xterm".to_string());
        }

        let working_dir = match &args.working_dir {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => environment
                .get("HOME")
                .map(PathBuf::from)
                .filter(|home| home.is_dir())
                .unwrap_or_else(|| PathBuf::from("/")),
        };

        let mut keys = vec![StreamKey::Control, StreamKey::Stdio];
        if args.split_stderr {
            keys.push(StreamKey::Stderr);
        }
        let stream_ids: HashMap<StreamKey, String> = keys
            .iter()
            .map(|key| (*key, self.new_stream_id()))
            .collect();

        let execution = Arc::new(Execution {
            command: args.command,
            environment,
            working_dir,
            timeout: args.timeout,
            identity,
            use_terminal: args.use_terminal,
            split_stderr: args.split_stderr,
            width: args.width,
            height: args.height,
            stream_ids: stream_ids.clone(),
            attached: Mutex::new(HashMap::new()),
            io_ready: OneShot::default(),
            control_ready: OneShot::default(),
            done: OneShot::default(),
            child_pid: Mutex::new(None),
            exit_code: Mutex::new(None),
        });

        let mut registry = self.registry.lock().unwrap();
        for (key, id) in stream_ids {
            registry.insert(id, (Arc::clone(&execution), key));
        }
        Ok(execution)
    }

    /// Attaches a peer stream by its opaque id. Each stream may be
    /// attached at most once.
    pub fn connect(
        &self,
        stream_id: &str,
        stream: Arc<dyn ExecStream>,
    ) -> Result<(), ExecError> {
        let (execution, key) = {
            let registry = self.registry.lock().unwrap();
            registry
                .get(stream_id)
                .cloned()
                .ok_or(ExecError::UnknownStream)?
        };

        {
            let mut attached = execution.attached.lock().unwrap();
            if attached.contains_key(&key) {
                return Err(ExecError::AlreadyConnected { key: key.as_str() });
            }
            attached.insert(key, stream);
        }

        if key == StreamKey::Control {
            execution.control_ready.fire();
        }
        if execution.io_attached() {
            execution.io_ready.fire();
        }
        Ok(())
    }

    /// Runs the execution to completion: waits for I/O attachment, spawns
    /// the child, mirrors bytes, honors the timeout, and returns the exit
    /// code. A non-zero exit is data, not an error; a timeout is an error.
    pub fn run(&self, execution: &Arc<Execution>) -> Result<i32, ExecError> {
        let result = self.run_inner(execution);
        // The stream ids are single-use whatever happened.
        let mut registry = self.registry.lock().unwrap();
        for id in execution.stream_ids.values() {
            registry.remove(id);
        }
        drop(registry);
        execution.done.fire();
        result
    }

    fn run_inner(&self, execution: &Arc<Execution>) -> Result<i32, ExecError> {
        if !execution.io_ready.wait_timeout(EXEC_ATTACH_TIMEOUT) {
            return Err(ExecError::Timeout(
                "timeout waiting for websocket connections".to_string(),
            ));
        }

        let stdio = execution
            .stream(StreamKey::Stdio)
            .expect("io streams are attached");
        let stderr_stream = execution
            .split_stderr
            .then(|| execution.stream(StreamKey::Stderr).expect("io streams are attached"));

        let mut cmd = Command::new(&execution.command[0]);
        cmd.args(&execution.command[1..])
            .env_clear()
            .envs(&execution.environment)
            .current_dir(&execution.working_dir);

        let mut master: Option<Arc<OwnedFd>> = None;
        let mut out_read: Option<OwnedFd> = None;
        let mut err_read: Option<OwnedFd> = None;

        if execution.use_terminal {
            let window = (execution.width > 0 && execution.height > 0).then(|| Winsize {
                ws_row: execution.height,
                ws_col: execution.width,
                ws_xpixel: 0,
                ws_ypixel: 0,
            });
            let pty = openpty(window.as_ref(), None::<&nix::sys::termios::Termios>)
                .map_err(|err| ExecError::SpawnError(io::Error::other(err)))?;
            let slave = pty.slave;
            cmd.stdin(Stdio::from(slave.try_clone().map_err(ExecError::SpawnError)?));
            if execution.split_stderr {
                let (read_end, write_end) = nix::unistd::pipe()
                    .map_err(|err| ExecError::SpawnError(io::Error::other(err)))?;
                cmd.stderr(Stdio::from(write_end));
                err_read = Some(read_end);
                cmd.stdout(Stdio::from(slave));
            } else {
                cmd.stdout(Stdio::from(
                    slave.try_clone().map_err(ExecError::SpawnError)?,
                ));
                cmd.stderr(Stdio::from(slave));
            }
            master = Some(Arc::new(pty.master));
        } else {
            cmd.stdin(Stdio::piped());
            let (read_end, write_end) = nix::unistd::pipe()
                .map_err(|err| ExecError::SpawnError(io::Error::other(err)))?;
            if execution.split_stderr {
                let (err_r, err_w) = nix::unistd::pipe()
                    .map_err(|err| ExecError::SpawnError(io::Error::other(err)))?;
                cmd.stderr(Stdio::from(err_w));
                err_read = Some(err_r);
                cmd.stdout(Stdio::from(write_end));
            } else {
                cmd.stdout(Stdio::from(
                    write_end.try_clone().map_err(ExecError::SpawnError)?,
                ));
                cmd.stderr(Stdio::from(write_end));
            }
            out_read = Some(read_end);
        }

        let identity = execution.identity;
        let use_terminal = execution.use_terminal;
        unsafe {
            use std::os::unix::process::CommandExt;
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                // With a PTY, stdin is the slave; adopt it as the
                // controlling terminal of the new session.
                if use_terminal && libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                if let Some(identity) = identity {
                    privilege::apply_identity(identity)?;
                }
                Ok(())
            });
        }

        let (mut child, watcher) = self.reaper.spawn(&mut cmd)?;
        // Close the parent's copies of the slave and pipe write ends so
        // the mirrors see EOF when the child dies.
        drop(cmd);
        let pid = child.id();
        *execution.child_pid.lock().unwrap() = Some(pid);
        debug!("exec child {pid} started");

        self.start_control_thread(execution, pid, master.clone());

        let mut drains = Vec::new();
        if let Some(master) = &master {
            let reader = File::from(
                master
                    .try_clone()
                    .map_err(|err| ExecError::SpawnError(io::Error::other(err)))?,
            );
            drains.push(pump_output(reader, Arc::clone(&stdio)));

            let writer = File::from(
                master
                    .try_clone()
                    .map_err(|err| ExecError::SpawnError(io::Error::other(err)))?,
            );
            forward_input(Arc::clone(&stdio), InputSink::Terminal(writer));
        } else {
            let out = out_read.take().expect("pipe mode has a stdout pipe");
            drains.push(pump_output(File::from(out), Arc::clone(&stdio)));
            forward_input(
                Arc::clone(&stdio),
                InputSink::Pipe(child.stdin.take().expect("stdin is piped")),
            );
        }
        if let Some(err_read) = err_read.take() {
            let stream = stderr_stream.expect("split stderr has a stream");
            drains.push(pump_output(File::from(err_read), stream));
        }

        let deadline = execution.timeout.map(|timeout| Instant::now() + timeout);
        let mut timed_out = false;
        let code = loop {
            if let Some(code) = watcher.wait_timeout(POLL_INTERVAL) {
                break code;
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                warn!("exec child {pid} timed out; killing");
                kill_group(pid, libc::SIGKILL);
                let _ = watcher.wait_timeout(Duration::from_secs(5));
                timed_out = true;
                break EXEC_UNKNOWN_EXIT_CODE;
            }
        };

        match child.wait() {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::ECHILD) => {}
            Err(err) => warn!("cannot release exec child handle: {err}"),
        }
        *execution.exit_code.lock().unwrap() = Some(code);

        // Let the mirrors drain whatever the child wrote before dying.
        for drain in drains {
            let _ = drain.join();
        }

        if timed_out {
            let timeout = execution.timeout.expect("timed out implies a timeout");
            return Err(ExecError::Timeout(format!(
                "exec timed out after {}",
                humantime::format_duration(timeout)
            )));
        }
        debug!("exec child {pid} finished with code {code}");
        Ok(code)
    }

    /// Runs the control loop once the control stream attaches; gives up
    /// silently if the execution finishes unattached.
    fn start_control_thread(
        &self,
        execution: &Arc<Execution>,
        pid: u32,
        master: Option<Arc<OwnedFd>>,
    ) {
        let execution = Arc::clone(execution);
        let _ = thread::Builder::new()
            .name("exec-control".to_string())
            .spawn(move || {
                loop {
                    if execution.control_ready.wait_timeout(POLL_INTERVAL) {
                        if let Some(stream) = execution.stream(StreamKey::Control) {
                            let master_fd = master.as_ref().map(|fd| fd.as_raw_fd());
                            control::control_loop(stream, pid, master_fd);
                        }
                        return;
                    }
                    if execution.done.wait_timeout(Duration::ZERO) {
                        return;
                    }
                }
            });
    }

    fn new_stream_id(&self) -> String {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(sequence.to_le_bytes());
        hasher.update(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
                .to_le_bytes(),
        );
        hasher
            .finalize()
            .iter()
            .take(16)
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}

enum InputSink {
    Pipe(std::process::ChildStdin),
    Terminal(File),
}

/// Forwards bytes received on the stream into the child's input. Runs
/// detached: it ends when the peer closes or drops the stream.
fn forward_input(stream: Arc<dyn ExecStream>, sink: InputSink) {
    let _ = thread::Builder::new()
        .name("exec-stdin".to_string())
        .spawn(move || {
            let mut sink = Some(sink);
            loop {
                match stream.recv() {
                    Ok(StreamFrame::Binary(bytes)) => {
                        let Some(open) = sink.as_mut() else { break };
                        let written = match open {
                            InputSink::Pipe(stdin) => stdin.write_all(&bytes),
                            InputSink::Terminal(master) => master.write_all(&bytes),
                        };
                        if written.is_err() {
                            break;
                        }
                    }
                    Ok(StreamFrame::Text(_)) => {}
                    Ok(StreamFrame::Close) | Err(_) => {
                        // Dropping a piped stdin delivers EOF to the child.
                        sink.take();
                        break;
                    }
                }
            }
        });
}

/// Copies child output bytes onto a stream until EOF, then sends a clean
/// close. A PTY master reports EIO when the slave side closes; that is
/// this channel's EOF.
fn pump_output(mut source: File, stream: Arc<dyn ExecStream>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("exec-out".to_string())
        .spawn(move || {
            let mut buffer = [0u8; 4096];
            loop {
                match source.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(count) => {
                        if stream
                            .send(StreamFrame::Binary(buffer[..count].to_vec()))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = stream.send(StreamFrame::Close);
        })
        .expect("spawn exec output thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::control::ControlMessage;
    use crate::reaper::test_reaper;

    fn collect_output(client: &ChannelStream) -> Vec<u8> {
        let mut bytes = Vec::new();
        loop {
            match client.recv() {
                Ok(StreamFrame::Binary(chunk)) => bytes.extend(chunk),
                Ok(StreamFrame::Close) | Err(_) => break,
                Ok(StreamFrame::Text(_)) => {}
            }
        }
        bytes
    }

    fn run_in_thread(
        manager: &Arc<ExecManager>,
        execution: &Arc<Execution>,
    ) -> thread::JoinHandle<Result<i32, ExecError>> {
        let manager = Arc::clone(manager);
        let execution = Arc::clone(execution);
        thread::spawn(move || manager.run(&execution))
    }

    fn attach(
        manager: &ExecManager,
        execution: &Execution,
        key: StreamKey,
    ) -> ChannelStream {
        let (client, server) = stream_pair();
        manager
            .connect(execution.stream_id(key).expect("stream id"), Arc::new(server))
            .expect("connect");
        client
    }

    #[test]
    fn empty_command_is_rejected() {
        let manager = ExecManager::new(test_reaper());
        let err = manager.exec(ExecArgs::default()).unwrap_err();
        assert!(matches!(err, ExecError::BadRequest(_)));
    }

    #[test]
    fn unknown_stream_id_is_rejected() {
        let manager = ExecManager::new(test_reaper());
        let (_, server) = stream_pair();
        let err = manager.connect("bogus", Arc::new(server)).unwrap_err();
        assert!(matches!(err, ExecError::UnknownStream));
    }

    #[test]
    fn streams_attach_at_most_once() {
        let manager = ExecManager::new(test_reaper());
        let execution = manager
            .exec(ExecArgs {
                command: vec!["true".to_string()],
                ..ExecArgs::default()
            })
            .expect("exec");

        let id = execution.stream_id(StreamKey::Stdio).expect("id").to_string();
        let (_, server_one) = stream_pair();
        manager.connect(&id, Arc::new(server_one)).expect("first");
        let (_, server_two) = stream_pair();
        let err = manager.connect(&id, Arc::new(server_two)).unwrap_err();
        assert!(matches!(
            err,
            ExecError::AlreadyConnected { key: "stdio" }
        ));
    }

    #[test]
    fn attach_deadline_fails_the_execution() {
        let manager = ExecManager::new(test_reaper());
        let execution = manager
            .exec(ExecArgs {
                command: vec!["true".to_string()],
                ..ExecArgs::default()
            })
            .expect("exec");

        let err = manager.run(&execution).unwrap_err();
        match err {
            ExecError::Timeout(message) => {
                assert_eq!(message, "timeout waiting for websocket connections");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn stdio_round_trips_through_cat() {
        let manager = ExecManager::new(test_reaper());
        let execution = manager
            .exec(ExecArgs {
                command: vec!["cat".to_string()],
                ..ExecArgs::default()
            })
            .expect("exec");

        let stdio = attach(&manager, &execution, StreamKey::Stdio);
        let _control = attach(&manager, &execution, StreamKey::Control);
        let runner = run_in_thread(&manager, &execution);

        stdio
            .send(StreamFrame::Binary(b"echoed through the child\n".to_vec()))
            .expect("send");
        stdio.close();

        let output = collect_output(&stdio);
        assert_eq!(output, b"echoed through the child\n");
        assert_eq!(runner.join().expect("join").expect("run"), 0);
        assert_eq!(execution.exit_code(), Some(0));
    }

    #[test]
    fn split_stderr_separates_the_streams() {
        let manager = ExecManager::new(test_reaper());
        let execution = manager
            .exec(ExecArgs {
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "echo out; echo err 1>&2".to_string(),
                ],
                split_stderr: true,
                ..ExecArgs::default()
            })
            .expect("exec");

        let stdio = attach(&manager, &execution, StreamKey::Stdio);
        let stderr = attach(&manager, &execution, StreamKey::Stderr);
        let _control = attach(&manager, &execution, StreamKey::Control);
        let runner = run_in_thread(&manager, &execution);

        assert_eq!(collect_output(&stdio), b"out\n");
        assert_eq!(collect_output(&stderr), b"err\n");
        assert_eq!(runner.join().expect("join").expect("run"), 0);
    }

    #[test]
    fn nonzero_exit_is_data_not_an_error() {
        let manager = ExecManager::new(test_reaper());
        let execution = manager
            .exec(ExecArgs {
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "exit 5".to_string(),
                ],
                ..ExecArgs::default()
            })
            .expect("exec");

        let _stdio = attach(&manager, &execution, StreamKey::Stdio);
        let runner = run_in_thread(&manager, &execution);
        assert_eq!(runner.join().expect("join").expect("run"), 5);
        assert_eq!(execution.exit_code(), Some(5));
    }

    #[test]
    fn timeout_kills_the_child() {
        let manager = ExecManager::new(test_reaper());
        let execution = manager
            .exec(ExecArgs {
                command: vec!["sleep".to_string(), "30".to_string()],
                timeout: Some(Duration::from_millis(200)),
                ..ExecArgs::default()
            })
            .expect("exec");

        let _stdio = attach(&manager, &execution, StreamKey::Stdio);
        let runner = run_in_thread(&manager, &execution);

        let begun = Instant::now();
        let err = runner.join().expect("join").unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
        assert!(begun.elapsed() < Duration::from_secs(5));
        assert_eq!(execution.exit_code(), Some(EXEC_UNKNOWN_EXIT_CODE));
    }

    #[test]
    fn signal_command_reaches_the_child() {
        let manager = ExecManager::new(test_reaper());
        let execution = manager
            .exec(ExecArgs {
                command: vec!["sleep".to_string(), "30".to_string()],
                ..ExecArgs::default()
            })
            .expect("exec");

        let _stdio = attach(&manager, &execution, StreamKey::Stdio);
        let control = attach(&manager, &execution, StreamKey::Control);
        let runner = run_in_thread(&manager, &execution);

        // Give the child a moment to appear before signalling it.
        thread::sleep(Duration::from_millis(200));
        let message = ControlMessage {
            command: "signal".to_string(),
            signal: Some(super::control::SignalArgs {
                name: "TERM".to_string(),
            }),
            resize: None,
        };
        control
            .send(StreamFrame::Text(
                serde_json::to_string(&message).expect("serialize"),
            ))
            .expect("send");

        assert_eq!(
            runner.join().expect("join").expect("run"),
            128 + libc::SIGTERM
        );
    }

    #[test]
    fn resolved_environment_carries_service_defaults() {
        let manager = ExecManager::new(test_reaper());
        let mut environment = HashMap::new();
        environment.insert("EXTRA".to_string(), "1".to_string());
        let execution = manager
            .exec(ExecArgs {
                command: vec!["true".to_string()],
                environment,
                ..ExecArgs::default()
            })
            .expect("exec");

        let metadata = execution.metadata();
        assert_eq!(metadata.environment.get("EXTRA").map(String::as_str), Some("1"));
        assert_eq!(
            metadata.environment.get("PATH").map(String::as_str),
            Some(DEFAULT_PATH_ENV)
        );
        assert_eq!(
            metadata.environment.get("LANG").map(String::as_str),
            Some(DEFAULT_LANG_ENV)
        );
        assert_eq!(metadata.stream_ids.len(), 2);
        assert!(metadata.stream_ids.contains_key("stdio"));
        assert!(metadata.stream_ids.contains_key("control"));
    }
}
