//! Runtime tunables read from `LISA_*` environment variables.
//!
//! Values that are missing, unparsable, or non-positive fall back to the
//! defaults below. The config is read once per process and passed down through
//! [`crate::engine::Engine`].

use std::time::Duration;

pub const DEFAULT_EVENT_LOCK_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_STATE_LOCK_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_EVENTS_MAX_BYTES: u64 = 262_144;
pub const DEFAULT_EVENTS_MAX_LINES: usize = 2000;
pub const DEFAULT_EVENT_RETENTION_DAYS: u64 = 14;
pub const DEFAULT_HEARTBEAT_STALE_SECONDS: i64 = 8;
pub const DEFAULT_OUTPUT_STALE_SECONDS: i64 = 240;
pub const DEFAULT_CMD_TIMEOUT_SECONDS: u64 = 20;
pub const DEFAULT_PROCESS_SCAN_INTERVAL_SECONDS: i64 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub event_lock_timeout_ms: u64,
    pub state_lock_timeout_ms: u64,
    pub events_max_bytes: u64,
    pub events_max_lines: usize,
    pub event_retention_days: u64,
    pub heartbeat_stale_seconds: i64,
    pub output_stale_seconds: i64,
    pub cmd_timeout_seconds: u64,
    pub process_scan_interval_seconds: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_lock_timeout_ms: DEFAULT_EVENT_LOCK_TIMEOUT_MS,
            state_lock_timeout_ms: DEFAULT_STATE_LOCK_TIMEOUT_MS,
            events_max_bytes: DEFAULT_EVENTS_MAX_BYTES,
            events_max_lines: DEFAULT_EVENTS_MAX_LINES,
            event_retention_days: DEFAULT_EVENT_RETENTION_DAYS,
            heartbeat_stale_seconds: DEFAULT_HEARTBEAT_STALE_SECONDS,
            output_stale_seconds: DEFAULT_OUTPUT_STALE_SECONDS,
            cmd_timeout_seconds: DEFAULT_CMD_TIMEOUT_SECONDS,
            process_scan_interval_seconds: DEFAULT_PROCESS_SCAN_INTERVAL_SECONDS,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            event_lock_timeout_ms: positive(&lookup, "LISA_EVENT_LOCK_TIMEOUT_MS")
                .unwrap_or(defaults.event_lock_timeout_ms),
            state_lock_timeout_ms: positive(&lookup, "LISA_STATE_LOCK_TIMEOUT_MS")
                .unwrap_or(defaults.state_lock_timeout_ms),
            events_max_bytes: positive(&lookup, "LISA_EVENTS_MAX_BYTES")
                .unwrap_or(defaults.events_max_bytes),
            events_max_lines: positive(&lookup, "LISA_EVENTS_MAX_LINES")
                .map(|v| v as usize)
                .unwrap_or(defaults.events_max_lines),
            event_retention_days: positive(&lookup, "LISA_EVENT_RETENTION_DAYS")
                .unwrap_or(defaults.event_retention_days),
            heartbeat_stale_seconds: positive(&lookup, "LISA_HEARTBEAT_STALE_SECONDS")
                .map(|v| v as i64)
                .unwrap_or(defaults.heartbeat_stale_seconds),
            output_stale_seconds: positive(&lookup, "LISA_OUTPUT_STALE_SECONDS")
                .map(|v| v as i64)
                .unwrap_or(defaults.output_stale_seconds),
            cmd_timeout_seconds: positive(&lookup, "LISA_CMD_TIMEOUT_SECONDS")
                .unwrap_or(defaults.cmd_timeout_seconds),
            process_scan_interval_seconds: defaults.process_scan_interval_seconds,
        }
    }

    pub fn cmd_timeout(&self) -> Duration {
        Duration::from_secs(self.cmd_timeout_seconds)
    }
}

fn positive<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_env_empty() {
        let config = RuntimeConfig::from_lookup(|_| None);
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.events_max_bytes, 262_144);
        assert_eq!(config.events_max_lines, 2000);
        assert_eq!(config.event_lock_timeout_ms, 5000);
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let env: HashMap<&str, &str> = [
            ("LISA_EVENTS_MAX_LINES", "25"),
            ("LISA_EVENTS_MAX_BYTES", "0"),
            ("LISA_STATE_LOCK_TIMEOUT_MS", "abc"),
            ("LISA_OUTPUT_STALE_SECONDS", " 30 "),
        ]
        .into_iter()
        .collect();
        let config = RuntimeConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.events_max_lines, 25);
        assert_eq!(config.events_max_bytes, DEFAULT_EVENTS_MAX_BYTES);
        assert_eq!(config.state_lock_timeout_ms, DEFAULT_STATE_LOCK_TIMEOUT_MS);
        assert_eq!(config.output_stale_seconds, 30);
    }
}
