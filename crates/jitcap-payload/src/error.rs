//! Error types for the capture core

use crate::events::{EventSourceError, FunctionId};
use crate::memory::MemoryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Enumeration failed for function 0x{function:X}: {source}")]
    Enumeration {
        function: FunctionId,
        #[source]
        source: EventSourceError,
    },

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Transport error: {0}")]
    Transport(#[from] jitcap_shared::Error),

    #[error("Session has ended")]
    SessionEnded,
}

pub type Result<T> = std::result::Result<T, CaptureError>;
