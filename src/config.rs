use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

/// Server settings, read once from `SLOTWISE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub max_connections: usize,
    /// Appends since the last compaction that trigger another one.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7433,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            max_connections: 256,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing or unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            bind: lookup("SLOTWISE_BIND").unwrap_or(d.bind),
            port: parse_var(&lookup, "SLOTWISE_PORT").unwrap_or(d.port),
            data_dir: lookup("SLOTWISE_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            metrics_port: parse_var(&lookup, "SLOTWISE_METRICS_PORT"),
            max_connections: parse_var(&lookup, "SLOTWISE_MAX_CONNECTIONS")
                .filter(|&n: &usize| n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: parse_var(&lookup, "SLOTWISE_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            compact_interval: parse_var(&lookup, "SLOTWISE_COMPACT_INTERVAL_SECS")
                .filter(|&s: &u64| s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.compact_interval),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotwise.wal")
    }
}
