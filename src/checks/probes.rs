//! Concrete health check probes.
//!
//! A probe performs one bounded run and reports success or a transient
//! failure. Probes never count failures themselves; threshold accounting
//! lives in the check manager.

use std::{
    fs::File,
    io::{self, Read},
    net::{TcpStream, ToSocketAddrs},
    process::{Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::{
    constants::{MAX_ERROR_LINES, MAX_ERROR_LINE_BYTES, POLL_INTERVAL},
    error::ProbeError,
    plan::{Check, ExecCheck, HttpCheck, TcpCheck},
    privilege,
    reaper::Reaper,
    supervisor::kill_group,
};

/// One kind of periodic probe.
pub trait Checker: Send {
    /// Runs the probe once, bounded by `timeout`. The `cancelled` flag is
    /// set when the owning check runtime is being torn down; a probe that
    /// can abort early (exec) should kill its child and bail out.
    fn check(&self, timeout: Duration, cancelled: &AtomicBool) -> Result<(), ProbeError>;
}

/// Builds the concrete probe for a check configuration. The plan
/// guarantees exactly one probe kind is configured.
pub fn new_checker(config: &Check, reaper: Arc<Reaper>) -> Box<dyn Checker> {
    if let Some(http) = &config.http {
        return Box::new(HttpChecker {
            config: http.clone(),
        });
    }
    if let Some(tcp) = &config.tcp {
        return Box::new(TcpChecker { config: tcp.clone() });
    }
    let exec = config
        .exec
        .clone()
        .expect("validated check has a probe configured");
    Box::new(ExecChecker {
        config: exec,
        reaper,
    })
}

/// GETs a URL and expects a 2xx response.
pub struct HttpChecker {
    config: HttpCheck,
}

impl Checker for HttpChecker {
    fn check(&self, timeout: Duration, _cancelled: &AtomicBool) -> Result<(), ProbeError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &self.config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| ProbeError::new(format!("invalid header \"{key}\": {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| ProbeError::new(format!("invalid header \"{key}\": {err}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProbeError::new(err.to_string()))?;

        let response = client
            .get(&self.config.url)
            .headers(headers)
            .send()
            .map_err(|err| ProbeError::new(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        // Keep a bounded excerpt of the body so the operator sees what the
        // endpoint actually said.
        let mut body = Vec::new();
        let limit = (MAX_ERROR_LINES * (MAX_ERROR_LINE_BYTES + 1)) as u64;
        let _ = response.take(limit).read_to_end(&mut body);
        let excerpt = excerpt_lines(&body);
        Err(ProbeError::with_details(
            format!(
                "non-2xx status code {}; see logs for details",
                status.as_u16()
            ),
            excerpt,
        ))
    }
}

/// Opens a TCP connection and closes it again.
pub struct TcpChecker {
    config: TcpCheck,
}

impl Checker for TcpChecker {
    fn check(&self, timeout: Duration, _cancelled: &AtomicBool) -> Result<(), ProbeError> {
        let host = if self.config.host.is_empty() {
            "localhost"
        } else {
            &self.config.host
        };
        let address = (host, self.config.port)
            .to_socket_addrs()
            .map_err(|err| ProbeError::new(format!("cannot resolve {host}: {err}")))?
            .next()
            .ok_or_else(|| ProbeError::new(format!("no addresses for {host}")))?;
        TcpStream::connect_timeout(&address, timeout)
            .map_err(|err| ProbeError::new(err.to_string()))?;
        Ok(())
    }
}

/// Runs a command and expects exit code zero.
pub struct ExecChecker {
    config: ExecCheck,
    reaper: Arc<Reaper>,
}

impl Checker for ExecChecker {
    fn check(&self, timeout: Duration, cancelled: &AtomicBool) -> Result<(), ProbeError> {
        let args = shlex::split(&self.config.command)
            .filter(|args| !args.is_empty())
            .ok_or_else(|| ProbeError::new("cannot parse check command"))?;

        let identity = privilege::normalize_ids(
            self.config.user_id,
            &self.config.user,
            self.config.group_id,
            &self.config.group,
        )
        .map_err(|err| ProbeError::new(err.to_string()))?;

        // One pipe takes both stdout and stderr so ordering is preserved.
        let (read_end, write_end) =
            nix::unistd::pipe().map_err(|err| ProbeError::new(err.to_string()))?;
        let write_clone = write_end
            .try_clone()
            .map_err(|err| ProbeError::new(err.to_string()))?;

        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..])
            .env_clear()
            .envs(&self.config.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(write_clone));
        if !self.config.working_dir.is_empty() {
            cmd.current_dir(&self.config.working_dir);
        }
        unsafe {
            use std::os::unix::process::CommandExt;
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if let Some(identity) = identity {
                    privilege::apply_identity(identity)?;
                }
                Ok(())
            });
        }

        let (mut child, watcher) = self
            .reaper
            .spawn(&mut cmd)
            .map_err(|err| ProbeError::new(err.to_string()))?;
        // Close the parent's copies of the pipe write ends, or the reader
        // never sees EOF.
        drop(cmd);

        let reader = thread::spawn(move || {
            let mut output = Vec::new();
            let _ = File::from(read_end).read_to_end(&mut output);
            output
        });

        let pid = child.id();
        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        let code = loop {
            if let Some(code) = watcher.wait_timeout(POLL_INTERVAL) {
                break code;
            }
            if cancelled.load(Ordering::SeqCst) {
                debug!("check command cancelled; killing pid {pid}");
                kill_group(pid, libc::SIGKILL);
                let _ = watcher.wait_timeout(Duration::from_secs(5));
                release(&mut child);
                let _ = reader.join();
                return Err(ProbeError::new("check cancelled"));
            }
            if Instant::now() >= deadline {
                kill_group(pid, libc::SIGKILL);
                let _ = watcher.wait_timeout(Duration::from_secs(5));
                timed_out = true;
                break -1;
            }
        };
        release(&mut child);

        if timed_out {
            let _ = reader.join();
            return Err(ProbeError::new("exec check timed out"));
        }

        let output = reader.join().unwrap_or_default();
        if code == 0 {
            return Ok(());
        }

        let excerpt = excerpt_lines(&output);
        Err(ProbeError::with_details(
            format!("exit status {code}"),
            excerpt,
        ))
    }
}

/// Releases a child handle whose PID the reaper already collected.
fn release(child: &mut std::process::Child) {
    match child.wait() {
        Ok(_) => {}
        Err(err) if err.raw_os_error() == Some(libc::ECHILD) => {}
        Err(err) => debug!("cannot release check child: {err}"),
    }
}

/// Keeps the last lines of captured output, bounded in count and width.
fn excerpt_lines(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(MAX_ERROR_LINES);
    lines[start..]
        .iter()
        .map(|line| {
            if line.len() > MAX_ERROR_LINE_BYTES {
                let mut cut = MAX_ERROR_LINE_BYTES;
                while !line.is_char_boundary(cut) {
                    cut -= 1;
                }
                &line[..cut]
            } else {
                line
            }
        })
        .collect::<Vec<&str>>()
        .join("\n")
}
