//! Configuration module.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

use crate::logsink::IndexConfig;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file (default: "netpulse.db")
    pub db_path: String,
    /// Worker pool size (default: 100)
    pub workers: usize,
    /// Probe queue capacity (default: 1000)
    pub queue_capacity: usize,
    /// Capacity of each log sink queue (default: 500)
    pub sink_capacity: usize,
    /// Per-check deadline in seconds (default: 30)
    pub probe_timeout_secs: u64,
    /// Directory for daily check logs (default: "logs")
    pub log_dir: String,
    /// Search-index sink; None leaves it disabled.
    pub index: Option<IndexConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "netpulse.db".to_string(),
            workers: 100,
            queue_capacity: 1000,
            sink_capacity: 500,
            probe_timeout_secs: 30,
            log_dir: "logs".to_string(),
            index: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// - `NETPULSE_DB_PATH`: database file path
    /// - `NETPULSE_WORKERS`: worker pool size
    /// - `NETPULSE_QUEUE_CAPACITY`: probe queue capacity
    /// - `NETPULSE_SINK_CAPACITY`: log sink queue capacity
    /// - `NETPULSE_PROBE_TIMEOUT_SECS`: per-check deadline
    /// - `NETPULSE_LOG_DIR`: check log directory
    /// - `NETPULSE_INDEX_URL`: search-index base URL (unset disables the sink)
    /// - `NETPULSE_INDEX_PREFIX`: index name prefix
    /// - `NETPULSE_INDEX_USERNAME` / `NETPULSE_INDEX_PASSWORD`: basic auth
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = env::var("NETPULSE_DB_PATH") {
            cfg.db_path = path;
        }
        if let Some(workers) = parse_env("NETPULSE_WORKERS") {
            cfg.workers = workers;
        }
        if let Some(capacity) = parse_env("NETPULSE_QUEUE_CAPACITY") {
            cfg.queue_capacity = capacity;
        }
        if let Some(capacity) = parse_env("NETPULSE_SINK_CAPACITY") {
            cfg.sink_capacity = capacity;
        }
        if let Some(timeout) = parse_env("NETPULSE_PROBE_TIMEOUT_SECS") {
            cfg.probe_timeout_secs = timeout;
        }
        if let Ok(dir) = env::var("NETPULSE_LOG_DIR") {
            cfg.log_dir = dir;
        }

        if let Ok(url) = env::var("NETPULSE_INDEX_URL") {
            cfg.index = Some(IndexConfig {
                url,
                prefix: env::var("NETPULSE_INDEX_PREFIX")
                    .unwrap_or_else(|_| "netpulse-checks".to_string()),
                username: env::var("NETPULSE_INDEX_USERNAME").ok(),
                password: env::var("NETPULSE_INDEX_PASSWORD").ok(),
            });
        }

        cfg
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.db_path, "netpulse.db");
        assert_eq!(cfg.workers, 100);
        assert_eq!(cfg.queue_capacity, 1000);
        assert_eq!(cfg.sink_capacity, 500);
        assert_eq!(cfg.probe_timeout_secs, 30);
        assert!(cfg.index.is_none());
    }
}
