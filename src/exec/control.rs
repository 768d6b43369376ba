//! Typed control channel for interactive execs.
//!
//! Control frames are JSON records with a command name and an optional
//! parameter struct, e.g. `{"command":"resize","resize":{"width":132,
//! "height":50}}`. Unknown commands are logged and skipped so that newer
//! clients keep working against older daemons.

use std::{io, os::fd::RawFd, str::FromStr, sync::Arc};

use nix::{sys::signal::Signal, unistd::Pid};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::exec::streams::{ExecStream, StreamError, StreamFrame};

/// One control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Command name ("resize", "signal", ...).
    pub command: String,

    /// Arguments for the "signal" command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalArgs>,

    /// Arguments for the "resize" command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizeArgs>,
}

/// Arguments of a "signal" command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalArgs {
    /// Signal name, with or without the SIG prefix ("TERM", "SIGTERM").
    pub name: String,
}

/// Arguments of a "resize" command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeArgs {
    /// Terminal width in columns.
    pub width: u16,
    /// Terminal height in rows.
    pub height: u16,
}

/// Maps a user-supplied signal name onto a platform signal number.
pub fn signal_from_name(name: &str) -> Option<Signal> {
    let full = if name.starts_with("SIG") {
        name.to_string()
    } else {
        format!("SIG{name}")
    };
    Signal::from_str(&full).ok()
}

/// Applies a window size to a PTY master.
pub(crate) fn set_winsize(fd: RawFd, width: u16, height: u16) -> io::Result<()> {
    let size = libc::winsize {
        ws_row: height,
        ws_col: width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &size) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Consumes control frames until the stream ends. A clean close just exits
/// the loop; an abnormal disconnect means the peer died mid-session, so
/// the child is killed rather than left running unattended.
pub(crate) fn control_loop(
    stream: Arc<dyn ExecStream>,
    child_pid: u32,
    pty_master: Option<RawFd>,
) {
    loop {
        match stream.recv() {
            Ok(StreamFrame::Text(text)) => {
                let message: ControlMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("invalid exec control message: {err}");
                        continue;
                    }
                };
                dispatch(&message, child_pid, pty_master);
            }
            Ok(StreamFrame::Binary(_)) => {
                debug!("ignoring binary frame on exec control stream");
            }
            Ok(StreamFrame::Close) | Err(StreamError::Closed) => break,
            Err(StreamError::Disconnected) => {
                warn!("exec control stream lost; killing child {child_pid}");
                crate::supervisor::kill_group(child_pid, libc::SIGKILL);
                break;
            }
        }
    }
}

fn dispatch(message: &ControlMessage, child_pid: u32, pty_master: Option<RawFd>) {
    match message.command.as_str() {
        "resize" => {
            let Some(master) = pty_master else {
                debug!("resize on an exec without a terminal; skipping");
                return;
            };
            let Some(args) = &message.resize else {
                warn!("resize command without resize arguments; skipping");
                return;
            };
            if let Err(err) = set_winsize(master, args.width, args.height) {
                warn!("cannot resize exec terminal: {err}");
            }
        }
        "signal" => {
            let Some(args) = &message.signal else {
                warn!("signal command without signal arguments; skipping");
                return;
            };
            match signal_from_name(&args.name) {
                Some(signal) => {
                    debug!("forwarding {signal} to exec child {child_pid}");
                    if let Err(err) =
                        nix::sys::signal::kill(Pid::from_raw(child_pid as i32), signal)
                    {
                        warn!("cannot signal exec child {child_pid}: {err}");
                    }
                }
                None => warn!("unknown signal name \"{}\"; skipping", args.name),
            }
        }
        other => debug!("ignoring unknown exec control command \"{other}\""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names_accept_both_spellings() {
        assert_eq!(signal_from_name("TERM"), Some(Signal::SIGTERM));
        assert_eq!(signal_from_name("SIGTERM"), Some(Signal::SIGTERM));
        assert_eq!(signal_from_name("HUP"), Some(Signal::SIGHUP));
        assert_eq!(signal_from_name("NOPE"), None);
    }

    #[test]
    fn control_messages_round_trip_as_json() {
        let message = ControlMessage {
            command: "resize".to_string(),
            signal: None,
            resize: Some(ResizeArgs {
                width: 132,
                height: 50,
            }),
        };
        let json = serde_json::to_string(&message).expect("serialize");
        assert!(json.contains("\"command\":\"resize\""));
        let back: ControlMessage = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, message);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let json = r#"{"command":"flourish","confetti":{"amount":9000}}"#;
        let message: ControlMessage = serde_json::from_str(json).expect("parse");
        assert_eq!(message.command, "flourish");
    }
}
