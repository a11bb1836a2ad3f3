//! Runtime settings for a confirmation watcher.
use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Settings, deserializable from the host application's config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// SQLite file backing the stores.
    pub database_path: PathBuf,
    /// Seconds between two timeout sweeps.
    pub sweep_interval_secs: u64,
    /// Re-send owed terminal results when the watcher starts.
    pub redeliver_on_start: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("chain-watch.sqlite"),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            redeliver_on_start: true,
        }
    }
}

impl WatcherConfig {
    /// Use `path` for the SQLite store.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Sweep every `interval` (rounded down to whole seconds, minimum 1s).
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs();
        self
    }

    /// Toggle redelivery of owed results at start.
    pub fn with_redeliver_on_start(mut self, enabled: bool) -> Self {
        self.redeliver_on_start = enabled;
        self
    }

    /// Interval between two timeout sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: WatcherConfig = serde_json::from_str(r#"{"sweep_interval_secs": 5}"#).unwrap();
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(5));
        assert_eq!(cfg.database_path, PathBuf::from("chain-watch.sqlite"));
        assert!(cfg.redeliver_on_start);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let cfg = WatcherConfig::default().with_sweep_interval(Duration::from_millis(10));
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(1));
    }
}
