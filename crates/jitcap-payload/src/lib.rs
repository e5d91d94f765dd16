//! In-process JIT code capture.
//!
//! The host adapter (a runtime profiler callback object) forwards attach and
//! compilation notifications to an [`Agent`]. For every newly compiled code
//! region the agent reads the native bytes, sends them to the consumer once,
//! then disassembles them and sends a resolved name for every call target.
//!
//! # Architecture
//!
//! - [`capture`] - enumerate, claim, capture, resolve
//! - [`disasm`] - call-target extraction (capstone)
//! - [`dedup`] - at-most-once gate on code start addresses
//! - [`events`] - what the capture core needs from the runtime
//! - [`agent`] - connect, announce, receive loop, detach

pub mod agent;
pub mod capture;
pub mod config;
pub mod dedup;
pub mod disasm;
pub mod error;
pub mod events;
pub mod machine;
pub mod memory;
pub mod session;

pub use agent::Agent;
pub use capture::{Capture, CaptureOptions, CaptureStatus, CaptureSummary, Dispatch};
pub use config::CaptureConfig;
pub use dedup::DedupCache;
pub use disasm::{TargetDedup, extract_targets};
pub use error::{CaptureError, Result};
pub use events::{
    CodeRegion, CompilationEvents, EventSourceError, FunctionId, NameOracle, NoNames, ReJitId,
};
pub use memory::{LocalMemory, MemoryError, ProcessMemory};
pub use session::Session;
