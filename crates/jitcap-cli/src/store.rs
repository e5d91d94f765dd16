//! In-memory record of everything a producer sent, and writing it to disk.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use jitcap_shared::{FunctionCallTarget, FunctionCode, Message, RequestFunctionCode, StartSession};
use log::{debug, info};

use crate::{Error, Result};

// =============================================================================
// Types
// =============================================================================

/// (process id, function id, re-JIT id)
type FunctionKey = (i32, i64, i32);

/// What was written by [`CaptureStore::write_to`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub code_files: usize,
    pub target_lines: usize,
}

/// Code bodies and call targets received during one session.
#[derive(Debug, Default)]
pub struct CaptureStore {
    session: Option<StartSession>,
    /// Keyed by (process id, code start address)
    code: BTreeMap<(i32, i64), FunctionCode>,
    /// Call targets by originating function, then destination address
    targets: BTreeMap<FunctionKey, BTreeMap<i64, String>>,
    with_code: HashSet<FunctionKey>,
    requested: HashSet<FunctionKey>,
}

// =============================================================================
// Public API
// =============================================================================

impl CaptureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<&StartSession> {
        self.session.as_ref()
    }

    pub fn code_count(&self) -> usize {
        self.code.len()
    }

    pub fn target_count(&self) -> usize {
        self.targets.values().map(BTreeMap::len).sum()
    }

    pub fn code_at(&self, process_id: i32, address: i64) -> Option<&FunctionCode> {
        self.code.get(&(process_id, address))
    }

    /// Record one message. Returns the code requests it makes necessary: a
    /// call target whose originating function has no code yet is asked for once.
    pub fn record(&mut self, message: Message) -> Vec<RequestFunctionCode> {
        match message {
            Message::StartSession(start) => {
                info!(
                    "producer {} started a session (machine 0x{:04X})",
                    start.process_id, start.process_kind
                );
                self.session = Some(start);
                Vec::new()
            }
            Message::FunctionCode(code) => {
                debug!(
                    "code for 0x{:X} at 0x{:X}, {} bytes",
                    code.function_id,
                    code.address,
                    code.code.len()
                );
                self.with_code
                    .insert((code.process_id, code.function_id, code.rejit_id));
                self.code.insert((code.process_id, code.address), code);
                Vec::new()
            }
            Message::FunctionCallTarget(target) => self.record_target(target),
            other => {
                debug!("ignoring {:?} from producer", other.kind());
                Vec::new()
            }
        }
    }

    /// Write `<address>.bin` per code body and a `targets.txt` listing into `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<WriteSummary> {
        std::fs::create_dir_all(dir).map_err(|source| Error::Write {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut summary = WriteSummary::default();
        for code in self.code.values() {
            let path = dir.join(format!("{:X}.bin", code.address));
            std::fs::write(&path, &code.code).map_err(|source| Error::Write {
                path: path.clone(),
                source,
            })?;
            summary.code_files += 1;
        }

        let mut listing = String::new();
        for (&(process_id, function_id, rejit_id), targets) in &self.targets {
            listing.push_str(&format!(
                "function 0x{:X} rejit {} process {}\n",
                function_id, rejit_id, process_id
            ));
            for (address, name) in targets {
                listing.push_str(&format!("  0x{:X} {}\n", address, name));
                summary.target_lines += 1;
            }
        }

        let path = dir.join("targets.txt");
        std::fs::write(&path, listing).map_err(|source| Error::Write { path, source })?;

        Ok(summary)
    }
}

// =============================================================================
// Internal
// =============================================================================

impl CaptureStore {
    fn record_target(&mut self, target: FunctionCallTarget) -> Vec<RequestFunctionCode> {
        let key = (target.process_id, target.function_id, target.rejit_id);
        self.targets
            .entry(key)
            .or_default()
            .insert(target.address, target.name);

        if self.with_code.contains(&key) || !self.requested.insert(key) {
            return Vec::new();
        }

        vec![RequestFunctionCode {
            function_id: target.function_id,
            // Start address is unknown until the code arrives.
            address: 0,
            rejit_id: target.rejit_id,
            process_id: target.process_id,
        }]
    }
}
