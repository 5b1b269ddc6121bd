//! Error types for the RedWire client.
//!
//! Server error replies are not errors here: they decode to
//! `RespValue::Error` and travel back as ordinary values.

use std::fmt;
use std::io;
use std::sync::Arc;

use redwire_common::ProtocolError;
use thiserror::Error;

use crate::engine::ConnectionState;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Which deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    Command,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Connect => f.write_str("connect"),
            TimeoutKind::Command => f.write_str("command"),
        }
    }
}

/// Errors surfaced by both drivers.
///
/// `Clone` because one fatal error fails every queued reply handler.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------
    /// Refused, reset, EOF or any other OS-level failure.
    #[error("io error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// Connect or command deadline elapsed.
    #[error("{0} timed out")]
    Timeout(TimeoutKind),

    // -------------------------------------------------------------------------
    // Protocol
    // -------------------------------------------------------------------------
    /// Malformed reply bytes; the connection is closed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A reply arrived while no command was waiting for one.
    #[error("unexpected reply with no pending command: {0}")]
    UnexpectedReply(String),

    /// The server answered a subscribe with an error reply. The
    /// registration has been dropped.
    #[error("subscribe to {topic} rejected: {reply}")]
    SubscribeRejected { topic: String, reply: String },

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------
    /// Operation not permitted in the current connection state.
    #[error("{operation} called with invalid state {state}")]
    InvalidState {
        operation: String,
        state: ConnectionState,
    },

    /// The connection was closed before a reply could be delivered.
    #[error("connection closed")]
    ConnectionClosed,

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------
    /// Endpoint could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Wraps an io error, mapping read/write timeouts to `Timeout(kind)`.
    pub fn from_io(err: io::Error, kind: TimeoutKind) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ClientError::Timeout(kind),
            _ => ClientError::Io(Arc::new(err)),
        }
    }

    /// EOF from the peer.
    pub fn eof() -> Self {
        ClientError::Io(Arc::new(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        )))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }

    /// True when the connection cannot be used after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Protocol(_) | ClientError::ConnectionClosed
        )
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}
