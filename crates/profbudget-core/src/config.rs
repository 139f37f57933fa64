//! Controller configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Size of one sampler buffer entry. Samplers are configured in entries,
    /// the controller enforces bytes.
    pub bytes_per_entry: u64,

    /// Entry counts outside `[min_entries, max_entries]` are clamped.
    pub min_entries: u32,
    pub max_entries: u32,

    /// Record every accounting event into a JSON diagnostic log.
    pub diagnostic_log: bool,

    /// Maximum rows kept in the diagnostic log; oldest rows are dropped first.
    pub diagnostic_log_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bytes_per_entry: 8,
            min_entries: 16 * 1024,         // 128 KiB
            max_entries: 128 * 1024 * 1024, // 1 GiB
            diagnostic_log: false,
            diagnostic_log_capacity: 64 * 1024,
        }
    }
}

impl ControllerConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `PROFBUDGET_BYTES_PER_ENTRY`: bytes per sampler entry
    /// - `PROFBUDGET_MIN_ENTRIES`: lower clamp for entry counts
    /// - `PROFBUDGET_MAX_ENTRIES`: upper clamp for entry counts
    /// - `PROFBUDGET_DIAGNOSTIC_LOG`: `1`/`true` enables the diagnostic log
    /// - `PROFBUDGET_DIAGNOSTIC_LOG_CAPACITY`: diagnostic log row limit
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("PROFBUDGET_BYTES_PER_ENTRY") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.bytes_per_entry = v;
            }
        }

        if let Ok(s) = std::env::var("PROFBUDGET_MIN_ENTRIES") {
            if let Ok(v) = s.parse::<u32>() {
                cfg.min_entries = v;
            }
        }

        if let Ok(s) = std::env::var("PROFBUDGET_MAX_ENTRIES") {
            if let Ok(v) = s.parse::<u32>() {
                cfg.max_entries = v;
            }
        }

        if let Ok(s) = std::env::var("PROFBUDGET_DIAGNOSTIC_LOG") {
            cfg.diagnostic_log = matches!(s.trim(), "1" | "true" | "TRUE" | "yes");
        }

        if let Ok(s) = std::env::var("PROFBUDGET_DIAGNOSTIC_LOG_CAPACITY") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.diagnostic_log_capacity = v;
            }
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.bytes_per_entry == 0 {
            return Err(Error::Config("bytes_per_entry must be non-zero".into()));
        }
        if self.min_entries > self.max_entries {
            return Err(Error::Config(format!(
                "min_entries ({}) exceeds max_entries ({})",
                self.min_entries, self.max_entries
            )));
        }
        Ok(())
    }

    pub fn clamp_entries(&self, entries: u32) -> u32 {
        entries.clamp(self.min_entries, self.max_entries.max(self.min_entries))
    }

    /// Byte budget for a sampler configured with `entries` buffer entries.
    pub fn budget_for_entries(&self, entries: u32) -> u64 {
        u64::from(self.clamp_entries(entries)).saturating_mul(self.bytes_per_entry)
    }
}
