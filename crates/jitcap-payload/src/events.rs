//! Interfaces to the host runtime.
//!
//! The profiler callback plumbing lives in a host adapter; the capture core
//! only needs the handful of queries below.

use thiserror::Error;

/// Opaque function identifier handed out by the runtime.
pub type FunctionId = u64;

/// Re-JIT generation id. Generation 0 is the original compilation.
pub type ReJitId = u64;

/// One contiguous region of native code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeRegion {
    pub start: u64,
    pub size: usize,
}

/// A query against the runtime failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: 0x{code:08X}")]
pub struct EventSourceError {
    pub operation: &'static str,
    /// HRESULT or other status code reported by the runtime
    pub code: u32,
}

impl EventSourceError {
    pub fn new(operation: &'static str, code: u32) -> Self {
        Self { operation, code }
    }
}

/// The runtime's view of compiled functions.
pub trait CompilationEvents: Send + Sync {
    /// All re-JIT generations of `function`.
    fn rejit_ids(&self, function: FunctionId) -> Result<Vec<ReJitId>, EventSourceError>;

    /// Native code start addresses of one generation.
    fn native_code_starts(
        &self,
        function: FunctionId,
        rejit: ReJitId,
    ) -> Result<Vec<u64>, EventSourceError>;

    /// Code regions that make up the body starting at `start`.
    fn code_regions(&self, start: u64) -> Result<Vec<CodeRegion>, EventSourceError>;

    /// Suspend all other managed threads. Returns false if unavailable.
    fn suspend_runtime(&self) -> bool {
        false
    }

    /// Undo a successful [`suspend_runtime`](Self::suspend_runtime).
    fn resume_runtime(&self) -> bool {
        false
    }

    /// Human-readable name, used only for logging.
    fn function_name(&self, _function: FunctionId) -> Option<String> {
        None
    }
}

/// Maps code addresses to display names.
pub trait NameOracle: Send + Sync {
    /// Method handle owning the code at `ip`, if it is managed code.
    fn method_handle_for_ip(&self, ip: u64) -> Option<u64>;

    /// Display name of a method handle.
    fn method_name(&self, method_handle: u64) -> Option<String>;

    /// Name of the JIT helper at `ip`.
    fn helper_name(&self, ip: u64) -> Option<String>;

    /// Method name first, helper name as fallback. Empty names count as misses.
    fn resolve(&self, ip: u64) -> Option<String> {
        self.method_handle_for_ip(ip)
            .filter(|&handle| handle != 0)
            .and_then(|handle| self.method_name(handle))
            .filter(|name| !name.is_empty())
            .or_else(|| self.helper_name(ip).filter(|name| !name.is_empty()))
    }
}

/// An oracle that never resolves anything, for hosts without name lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNames;

impl NameOracle for NoNames {
    fn method_handle_for_ip(&self, _ip: u64) -> Option<u64> {
        None
    }

    fn method_name(&self, _method_handle: u64) -> Option<String> {
        None
    }

    fn helper_name(&self, _ip: u64) -> Option<String> {
        None
    }
}
