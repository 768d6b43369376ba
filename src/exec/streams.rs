//! Exec stream transport abstraction.
//!
//! The engine multiplexes an execution over separate logical streams
//! (stdio, optional stderr, control) instead of framing one connection:
//! data channels stay raw binary while the control channel carries JSON.
//! The transport behind a stream is abstract; production wires these to
//! websockets, tests use the in-process channel pair below.

use std::sync::{
    Mutex,
    mpsc::{Receiver, Sender, channel},
};

use thiserror::Error;

/// One message on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Raw bytes (stdio and stderr payloads).
    Binary(Vec<u8>),
    /// A text frame (JSON control commands).
    Text(String),
    /// A clean close notification.
    Close,
}

/// Stream transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The stream was closed cleanly and no more frames will arrive.
    #[error("stream closed")]
    Closed,

    /// The peer disappeared mid-session without a close frame.
    #[error("stream peer disconnected")]
    Disconnected,
}

/// A duplex message stream attached to one exec channel.
///
/// Both halves may be used from different threads concurrently, so the
/// methods take `&self`.
pub trait ExecStream: Send + Sync {
    /// Receives the next frame, blocking until one arrives.
    fn recv(&self) -> Result<StreamFrame, StreamError>;

    /// Sends a frame to the peer.
    fn send(&self, frame: StreamFrame) -> Result<(), StreamError>;
}

/// In-process stream endpoint backed by a pair of channels.
pub struct ChannelStream {
    tx: Sender<StreamFrame>,
    rx: Mutex<Receiver<StreamFrame>>,
}

impl ChannelStream {
    /// Sends a clean close to the peer.
    pub fn close(&self) {
        let _ = self.send(StreamFrame::Close);
    }
}

impl ExecStream for ChannelStream {
    fn recv(&self) -> Result<StreamFrame, StreamError> {
        self.rx
            .lock()
            .unwrap()
            .recv()
            .map_err(|_| StreamError::Disconnected)
    }

    fn send(&self, frame: StreamFrame) -> Result<(), StreamError> {
        self.tx.send(frame).map_err(|_| StreamError::Disconnected)
    }
}

/// Creates a connected pair of in-process streams. Frames sent on one
/// endpoint arrive at the other. Dropping an endpoint without sending
/// [`StreamFrame::Close`] shows up at the peer as an abnormal disconnect.
pub fn stream_pair() -> (ChannelStream, ChannelStream) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();
    (
        ChannelStream {
            tx: a_tx,
            rx: Mutex::new(a_rx),
        },
        ChannelStream {
            tx: b_tx,
            rx: Mutex::new(b_rx),
        },
    )
}
