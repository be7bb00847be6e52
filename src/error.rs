//! Error types for wisp
//!
//! Library code returns these typed errors so callers can tell a bad
//! argument from an unreachable peer from a slow one. Binaries wrap them in
//! `anyhow` and map them back to process exit codes.

use crate::verbs::{VerbsError, WcStatus};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Exit code for a client role started without a server address.
pub const EXIT_MISSING_ADDRESS: u8 = 3;
/// Exit code for a non-numeric or out-of-range key/payload size.
pub const EXIT_INVALID_CONFIG: u8 = 4;
/// Exit code for an unrecoverable transport setup failure.
pub const EXIT_SETUP_FAILURE: u8 = 5;
/// Exit code for a session that failed after it was established.
pub const EXIT_SESSION_FAILURE: u8 = 6;

/// Invalid user-supplied parameters. Reported immediately, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("lacks server address")]
    MissingServerAddress,

    #[error("invalid server address '{0}'")]
    InvalidAddress(String),

    #[error("{name} invalid: '{value}' is not a number")]
    InvalidSize { name: &'static str, value: String },

    #[error("{name} invalid: {value} is outside 0..={max}")]
    SizeOutOfRange {
        name: &'static str,
        value: i64,
        max: usize,
    },

    #[error("frame of {len} bytes exceeds the connection limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("iteration count must be at least 1")]
    ZeroIterations,
}

impl ConfigError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ConfigError::MissingServerAddress => EXIT_MISSING_ADDRESS,
            _ => EXIT_INVALID_CONFIG,
        }
    }
}

/// Low-level cause behind a send or receive failure.
#[derive(Debug, Error)]
pub enum Fault {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("work completion failed with status {0}")]
    Completion(WcStatus),

    #[error(transparent)]
    Verbs(#[from] VerbsError),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("message of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("connection is {0}, not ready")]
    NotReady(crate::transport::ConnectionState),
}

/// Transport and session level errors.
///
/// Every variant is fatal for the connection it was raised on and never
/// for any other connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("send failed: {0}")]
    Send(#[source] Fault),

    #[error("receive failed: {0}")]
    Receive(#[source] Fault),

    #[error("no completion within {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    pub fn handshake(context: &str, err: impl std::fmt::Display) -> Self {
        TransportError::Handshake(format!("{}: {}", context, err))
    }

    /// True for the error kind callers may reasonably retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            TransportError::Config(e) => e.exit_code(),
            TransportError::Bind { .. }
            | TransportError::Connect { .. }
            | TransportError::Accept(_)
            | TransportError::Handshake(_) => EXIT_SETUP_FAILURE,
            TransportError::Send(_) | TransportError::Receive(_) | TransportError::Timeout(_) => {
                EXIT_SESSION_FAILURE
            }
        }
    }
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
