//! Configuration management for Cinnabar
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. CLI arguments (highest precedence, applied by the binary)
//! 2. Environment variables (CNB_* prefix)
//! 3. An explicit `--config <path>` file, or, when none is given:
//!    cinnabar.toml (project config in the working directory), then
//!    ~/.config/cinnabar/config.toml (user defaults)
//! 4. Built-in defaults (lowest precedence)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

/// Main Cinnabar configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CinnabarConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind the listener on.
    pub bind_host: String,
    /// Listening port; `None` falls back to the role default
    /// (6379 primary, 6380 replica).
    pub port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the on-disk snapshot file.
    pub snapshot_path: PathBuf,
    /// Target of the BACKUP command.
    pub backup_path: PathBuf,
    /// Live keyspace cap enforced by the sweeper.
    pub max_keys: usize,
    /// Seconds between sweeper passes.
    pub sweep_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("cinnabar.cdb"),
            backup_path: PathBuf::from("backup.rdb"),
            max_keys: 1000,
            sweep_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Replication id advertised when running as primary.
    pub replication_id: String,
    /// Backlog capacity in bytes.
    pub backlog_capacity: usize,
    /// Seconds between heartbeat passes.
    pub heartbeat_interval_secs: u64,
    /// Primary to follow; set by `--slave` or here.
    pub master_host: Option<String>,
    pub master_port: Option<u16>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_id: "primary-01".to_string(),
            backlog_capacity: 1024 * 1024,
            heartbeat_interval_secs: 10,
            master_host: None,
            master_port: None,
        }
    }
}

impl CinnabarConfig {
    /// The `(host, port)` of the primary to follow, when both are set.
    pub fn replica_of(&self) -> Option<(String, u16)> {
        match (&self.replication.master_host, self.replication.master_port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = CinnabarConfig::default();
        assert_eq!(config.server.bind_host, "127.0.0.1");
        assert_eq!(config.server.port, None);
        assert_eq!(config.storage.max_keys, 1000);
        assert_eq!(config.replication.backlog_capacity, 1024 * 1024);
        assert!(config.replica_of().is_none());
    }

    #[test]
    fn replica_of_requires_both_fields() {
        let mut config = CinnabarConfig::default();
        config.replication.master_host = Some("10.0.0.1".to_string());
        assert!(config.replica_of().is_none());

        config.replication.master_port = Some(6379);
        assert_eq!(config.replica_of(), Some(("10.0.0.1".to_string(), 6379)));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: CinnabarConfig = toml::from_str(
            r#"
            [storage]
            max_keys = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.max_keys, 50);
        assert_eq!(config.storage.sweep_interval_secs, 10);
        assert_eq!(config.server.bind_host, "127.0.0.1");
    }
}
