//! Coordinator runtime configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Everything the `serve` command needs, layered from defaults, an optional
/// config file, `CONDUCTOR_*` environment variables, and CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Directory holding the store file and the `config/` tree.
    pub data_dir: PathBuf,
    /// HTTP listen address.
    pub listen: SocketAddr,
    /// Require bearer tokens on every request.
    pub auth_enabled: bool,
    /// External verifier endpoint tokens are delegated to.
    pub auth_verifier_url: Option<String>,
    /// Missed-heartbeat warning threshold.
    pub heartbeat_stale_seconds: u64,
    /// Runner removal threshold.
    pub heartbeat_remove_seconds: u64,
    /// Pending runs with no eligible runner fail after this window.
    pub dispatch_timeout_seconds: u64,
    /// Nested hook runs are abandoned after this window.
    pub hook_timeout_seconds: u64,
    /// How long `GET /runner/runs` holds a long poll.
    pub long_poll_seconds: u64,
    /// Background sweeper tick interval.
    pub sweep_interval_seconds: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            listen: "127.0.0.1:7180".parse().expect("default listen address"),
            auth_enabled: false,
            auth_verifier_url: None,
            heartbeat_stale_seconds: 120,
            heartbeat_remove_seconds: 600,
            dispatch_timeout_seconds: 300,
            hook_timeout_seconds: 600,
            long_poll_seconds: 25,
            sweep_interval_seconds: 10,
        }
    }
}

impl CoordinatorConfig {
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("conductor.db")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.data_dir.join("config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.heartbeat_stale_seconds, 120);
        assert_eq!(config.heartbeat_remove_seconds, 600);
        assert!(!config.auth_enabled);
        assert!(config.store_path().ends_with("conductor.db"));
    }
}
