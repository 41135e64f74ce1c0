use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;
const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;

/// Daemon settings, read from `CLINICSCHED_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub reconcile_interval: Duration,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unparseable numbers fall
    /// back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let reconcile_secs = lookup("CLINICSCHED_RECONCILE_INTERVAL_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_RECONCILE_INTERVAL_SECS);
        Self {
            data_dir: lookup("CLINICSCHED_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            reconcile_interval: Duration::from_secs(reconcile_secs),
            compact_threshold: lookup("CLINICSCHED_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
            metrics_port: lookup("CLINICSCHED_METRICS_PORT").and_then(|s| s.parse().ok()),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("clinicsched.wal")
    }
}
