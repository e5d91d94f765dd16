//! Set of code start addresses already sent during a session.

use parking_lot::Mutex;
use std::collections::HashSet;

/// At-most-once gate keyed on the native code start address.
///
/// The re-JIT id is not part of the key: a new generation that
/// lands on a recycled start address is dropped. Entries are never evicted.
#[derive(Debug, Default)]
pub struct DedupCache {
    sent: Mutex<HashSet<u64>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `address`. Returns true only the first time it is seen.
    pub fn try_claim(&self, address: u64) -> bool {
        self.sent.lock().insert(address)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.sent.lock().contains(&address)
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_claim_twice() {
        let cache = DedupCache::new();
        assert!(cache.try_claim(0x1000));
        assert!(!cache.try_claim(0x1000));
        assert!(cache.try_claim(0x2000));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(0x1000));
        assert!(!cache.contains(0x3000));
    }

    #[test]
    fn test_concurrent_claims() {
        let cache = Arc::new(DedupCache::new());
        let contested_wins = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8u64)
            .map(|t| {
                let cache = Arc::clone(&cache);
                let contested_wins = Arc::clone(&contested_wins);
                thread::spawn(move || {
                    for i in 0..500u64 {
                        // Distinct per thread: every claim must win.
                        assert!(cache.try_claim((t << 32) | i));
                        // Shared by all threads: exactly one claim may win.
                        if cache.try_claim(0xDEAD_0000 + i) {
                            contested_wins.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(contested_wins.load(Ordering::Relaxed), 500);
        assert_eq!(cache.len(), 8 * 500 + 500);
    }
}
