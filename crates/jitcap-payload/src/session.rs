//! One instrumentation attachment.

use crate::dedup::DedupCache;
use jitcap_shared::Architecture;
use std::sync::atomic::{AtomicBool, Ordering};

/// State owned by a single attach. Nothing here outlives the session.
#[derive(Debug)]
pub struct Session {
    process_id: u32,
    architecture: Architecture,
    ended: AtomicBool,
    sent: DedupCache,
}

impl Session {
    pub fn new(process_id: u32, architecture: Architecture) -> Self {
        Self {
            process_id,
            architecture,
            ended: AtomicBool::new(false),
            sent: DedupCache::new(),
        }
    }

    /// Session for the calling process.
    pub fn current(architecture: Architecture) -> Self {
        Self::new(std::process::id(), architecture)
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Code start addresses already sent.
    pub fn sent(&self) -> &DedupCache {
        &self.sent
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Mark the session ended. Returns true if this call did the transition.
    pub fn end(&self) -> bool {
        !self.ended.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_is_one_way() {
        let session = Session::new(42, Architecture::X64);
        assert!(!session.is_ended());
        assert!(session.end());
        assert!(session.is_ended());
        assert!(!session.end());
        assert!(session.is_ended());
    }

    #[test]
    fn test_current_process() {
        let session = Session::current(Architecture::native());
        assert_eq!(session.process_id(), std::process::id());
        assert!(session.sent().is_empty());
    }
}
