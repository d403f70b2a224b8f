//! Error types for mail-probe

use std::time::Duration;
use thiserror::Error;

/// Transport-level failures of a probe session.
///
/// An authentication rejection by the server is not an error: it is
/// reported through [`crate::Phase::AuthFailed`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connect error: {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("TLS upgrade error: {0}")]
    Upgrade(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid use of session: {0}")]
    Usage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map an I/O error from an established transport.
    ///
    /// Resets, broken pipes and unexpected EOFs mean the peer is gone
    /// and surface as [`Error::ConnectionClosed`].
    pub(crate) fn from_transport(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => Self::ConnectionClosed,
            _ => Self::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
