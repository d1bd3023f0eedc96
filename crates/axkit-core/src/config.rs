//! Engine configuration
//!
//! Defaults, then `AXKIT_*` environment variables, then whatever the caller
//! sets explicitly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_depth: usize,
    pub time_budget_ms: u64,
    /// Check the clock every this many node visits.
    pub time_check_interval: usize,
    pub row_tolerance: f64,
    /// Root of the session store. `None` uses the platform cache directory.
    pub session_root: Option<PathBuf>,
    pub max_snapshots: usize,
    pub event_queue_capacity: usize,
    pub wait_poll_ms: u64,
    /// How far a re-resolved element may have moved, in points.
    pub resolve_tolerance: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_depth: 25,
            time_budget_ms: 5000,
            time_check_interval: 16,
            row_tolerance: 10.0,
            session_root: None,
            max_snapshots: 5,
            event_queue_capacity: 1024,
            wait_poll_ms: 100,
            resolve_tolerance: 50.0,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::invalid_command(format!("invalid config {}: {}", path.display(), e))
        })
    }

    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup. Unparseable values are ignored
    /// with a warning.
    pub fn with_env(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparseable setting");
                    None
                }
            }
        }

        if let Some(v) = parse("AXKIT_MAX_DEPTH", get("AXKIT_MAX_DEPTH")) {
            self.max_depth = v;
        }
        if let Some(v) = parse("AXKIT_TIME_BUDGET_MS", get("AXKIT_TIME_BUDGET_MS")) {
            self.time_budget_ms = v;
        }
        if let Some(v) = parse("AXKIT_TIME_CHECK_INTERVAL", get("AXKIT_TIME_CHECK_INTERVAL")) {
            self.time_check_interval = v;
        }
        if let Some(v) = parse("AXKIT_ROW_TOLERANCE", get("AXKIT_ROW_TOLERANCE")) {
            self.row_tolerance = v;
        }
        if let Some(v) = get("AXKIT_SESSION_ROOT").filter(|v| !v.trim().is_empty()) {
            self.session_root = Some(PathBuf::from(v));
        }
        if let Some(v) = parse("AXKIT_MAX_SNAPSHOTS", get("AXKIT_MAX_SNAPSHOTS")) {
            self.max_snapshots = v;
        }
        if let Some(v) = parse("AXKIT_EVENT_QUEUE", get("AXKIT_EVENT_QUEUE")) {
            self.event_queue_capacity = v;
        }
        if let Some(v) = parse("AXKIT_WAIT_POLL_MS", get("AXKIT_WAIT_POLL_MS")) {
            self.wait_poll_ms = v;
        }
        if let Some(v) = parse("AXKIT_RESOLVE_TOLERANCE", get("AXKIT_RESOLVE_TOLERANCE")) {
            self.resolve_tolerance = v;
        }
        self
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms.max(1))
    }

    /// Session root, falling back to `<cache dir>/axkit/sessions`.
    pub fn session_root(&self) -> PathBuf {
        self.session_root.clone().unwrap_or_else(default_session_root)
    }
}

pub fn default_session_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("axkit")
        .join("sessions")
}
