//! Attach-time configuration.
//!
//! The payload has no command line, so settings come from the environment of
//! the instrumented process.

use jitcap_shared::{DEFAULT_SEND_TIMEOUT, PIPE_NAME};
use log::warn;
use std::time::Duration;

pub const ENV_PIPE: &str = "JITCAP_PIPE";
pub const ENV_SEND_TIMEOUT_MS: &str = "JITCAP_SEND_TIMEOUT_MS";
pub const ENV_SUSPEND_RUNTIME: &str = "JITCAP_SUSPEND_RUNTIME";
pub const ENV_ARM64_DEDUP: &str = "JITCAP_ARM64_DEDUP";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Endpoint name the consumer listens on
    pub pipe_name: String,
    /// Bound on a single send; `None` waits forever
    pub send_timeout: Option<Duration>,
    /// Bracket captures with a runtime suspend/resume when blocking is safe
    pub suspend_runtime: bool,
    /// Dedup call targets within a scan on ARM too
    pub arm64_dedup: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pipe_name: PIPE_NAME.to_string(),
            send_timeout: Some(DEFAULT_SEND_TIMEOUT),
            suspend_runtime: true,
            arm64_dedup: false,
        }
    }
}

impl CaptureConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to fetch variables. Unparseable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup(ENV_PIPE) {
            let name = name.trim();
            if name.is_empty() {
                warn!("{} is empty, using {}", ENV_PIPE, config.pipe_name);
            } else {
                config.pipe_name = name.to_string();
            }
        }

        if let Some(value) = lookup(ENV_SEND_TIMEOUT_MS) {
            match value.trim().parse::<u64>() {
                // 0 means unbounded
                Ok(0) => config.send_timeout = None,
                Ok(ms) => config.send_timeout = Some(Duration::from_millis(ms)),
                Err(e) => warn!("ignoring {}={:?}: {}", ENV_SEND_TIMEOUT_MS, value, e),
            }
        }

        if let Some(value) = lookup(ENV_SUSPEND_RUNTIME) {
            match parse_flag(&value) {
                Some(flag) => config.suspend_runtime = flag,
                None => warn!("ignoring {}={:?}", ENV_SUSPEND_RUNTIME, value),
            }
        }

        if let Some(value) = lookup(ENV_ARM64_DEDUP) {
            match parse_flag(&value) {
                Some(flag) => config.arm64_dedup = flag,
                None => warn!("ignoring {}={:?}", ENV_ARM64_DEDUP, value),
            }
        }

        config
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
