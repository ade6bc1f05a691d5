//! Connection handle abstraction.
//!
//! A [`ConnectionHandle`] is one joined, duplex, message-oriented endpoint.
//! Sessions only talk to their members through this trait, so the registry
//! works the same over WebSocket connections and in-process channels.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use thiserror::Error;

/// Identity of a connection, unique within a session.
///
/// For WebSocket connections this is the peer's transport address.
pub type ConnectionId = String;

/// Boxed future returned by [`ConnectionHandle`] methods.
pub type HandleFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors raised by a single connection's send or receive.
///
/// These never escape a session as a whole: a failing member is removed and
/// the operation carries on with the others.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The channel was closed, locally or by the peer.
    #[error("connection closed")]
    Closed,

    /// A send did not complete within the allowed time.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// A single message passed through a session untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload.
    Text(String),
    /// Arbitrary binary payload.
    Binary(Vec<u8>),
}

impl Frame {
    /// Returns the payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(data) => data,
        }
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::Text(text.to_string())
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(data: Vec<u8>) -> Self {
        Frame::Binary(data)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Sending and receiving.
    Open,
    /// Close has started; no new sends are accepted.
    Closing,
    /// Terminal.
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Atomic `Open -> Closing -> Closed` state machine shared by handle
/// implementations.
///
/// Only one caller wins [`begin_close`](Self::begin_close), so teardown runs
/// once no matter how many actors race to close the same connection.
#[derive(Debug)]
pub struct ConnectionStatus(AtomicU8);

impl ConnectionStatus {
    /// Creates a status in the `Open` state.
    pub fn new() -> Self {
        Self(AtomicU8::new(STATE_OPEN))
    }

    /// Returns the current state.
    pub fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Returns true while the connection is open.
    pub fn is_open(&self) -> bool {
        self.get() == ConnectionState::Open
    }

    /// Moves `Open -> Closing`.
    ///
    /// Returns true for the single caller that performed the transition.
    pub fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `Closed`. Re-entering is a no-op.
    pub fn finish_close(&self) {
        self.0.store(STATE_CLOSED, Ordering::Release);
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// One duplex message channel joined to a session.
///
/// `send` and `receive` may be called concurrently from different tasks:
/// the connection loop blocks in `receive` while broadcasts from other
/// members call `send`. `close` must be idempotent.
pub trait ConnectionHandle: Send + Sync {
    /// Returns the stable identity of this connection.
    fn id(&self) -> &ConnectionId;

    /// Returns the current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Sends one frame to the peer.
    fn send(&self, frame: Frame) -> HandleFuture<'_, Result<(), ConnectionError>>;

    /// Waits for the next frame from the peer.
    ///
    /// Fails once the channel is closed or broken; a failure is terminal.
    fn receive(&self) -> HandleFuture<'_, Result<Frame, ConnectionError>>;

    /// Closes the connection. Safe to call more than once.
    fn close(&self) -> HandleFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_starts_open() {
        let status = ConnectionStatus::new();
        assert_eq!(status.get(), ConnectionState::Open);
        assert!(status.is_open());
    }

    #[test]
    fn test_status_close_transitions() {
        let status = ConnectionStatus::new();

        assert!(status.begin_close());
        assert_eq!(status.get(), ConnectionState::Closing);
        assert!(!status.is_open());

        status.finish_close();
        assert_eq!(status.get(), ConnectionState::Closed);
    }

    #[test]
    fn test_status_begin_close_only_once() {
        let status = ConnectionStatus::new();
        assert!(status.begin_close());
        assert!(!status.begin_close());

        status.finish_close();
        assert!(!status.begin_close());
        assert_eq!(status.get(), ConnectionState::Closed);
    }

    #[test]
    fn test_finish_close_idempotent() {
        let status = ConnectionStatus::new();
        status.begin_close();
        status.finish_close();
        status.finish_close();
        assert_eq!(status.get(), ConnectionState::Closed);
    }

    #[test]
    fn test_frame_bytes() {
        let text = Frame::from("hello world");
        assert_eq!(text.as_bytes(), b"hello world");
        assert_eq!(text.len(), 11);

        let binary = Frame::from(vec![0u8, 1, 2]);
        assert_eq!(binary.as_bytes(), &[0, 1, 2]);
        assert!(!binary.is_empty());

        assert!(Frame::Binary(Vec::new()).is_empty());
    }

    #[test]
    fn test_connection_error_display() {
        assert_eq!(ConnectionError::Closed.to_string(), "connection closed");
        assert_eq!(
            ConnectionError::Timeout(Duration::from_millis(250)).to_string(),
            "send timed out after 250ms"
        );
        assert_eq!(
            ConnectionError::Transport("reset".to_string()).to_string(),
            "transport error: reset"
        );
    }
}
