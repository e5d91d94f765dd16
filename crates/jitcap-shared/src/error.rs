//! Error types for jitcap.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not connected")]
    NotConnected,

    #[error("I/O timed out")]
    Timeout,

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Malformed frames or message bodies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown message kind {0}")]
    UnknownKind(i32),

    #[error("invalid frame size {0}")]
    InvalidSize(i32),

    #[error("message too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },

    #[error("truncated {what}: need {expected} bytes, have {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("negative length {0}")]
    NegativeLength(i32),
}

pub type Result<T> = std::result::Result<T, Error>;
