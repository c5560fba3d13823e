//! Server configuration file
//!
//! A single JSON object. Only `log_dir` is required; every other field has
//! a default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::observability::Severity;
use crate::replication::{SenderConfig, ServerMode, DEFAULT_MAX_SEND_SIZE};
use crate::spi::SpiConfig;
use crate::wal::DEFAULT_SEGMENT_SIZE;

use super::errors::{CliError, CliResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory holding the log segment files (required)
    pub log_dir: String,

    /// Directory for persistent slot state. Slots are kept in memory when absent.
    #[serde(default)]
    pub slot_dir: Option<String>,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Generated at startup when absent.
    #[serde(default)]
    pub system_id: Option<String>,

    #[serde(default = "default_node_name")]
    pub node_name: String,

    #[serde(default)]
    pub database: Option<String>,

    /// "primary", "standby", "cascade", "pending" or "normal"
    #[serde(default = "default_server_mode")]
    pub server_mode: String,

    #[serde(default = "default_one")]
    pub timeline: u32,

    #[serde(default = "default_one")]
    pub term: u32,

    /// Zero disables the liveness timeout.
    #[serde(default = "default_sender_timeout_ms")]
    pub sender_timeout_ms: u64,

    /// Zero disables log control pacing.
    #[serde(default)]
    pub target_rto_secs: i64,

    /// Pacing sleep adjustment per sample.
    #[serde(default = "default_log_control_step_ms")]
    pub log_control_step_ms: u64,

    #[serde(default = "default_log_control_max_sleep_ms")]
    pub log_control_max_sleep_ms: u64,

    #[serde(default = "default_max_send_size")]
    pub max_send_size: u64,

    #[serde(default = "default_segment_size")]
    pub segment_size: u64,

    #[serde(default = "default_keep_segments")]
    pub keep_segments: u64,

    #[serde(default = "default_true")]
    pub stream_replication_enabled: bool,

    #[serde(default = "default_max_senders")]
    pub max_senders: usize,

    #[serde(default)]
    pub replication_channels: Vec<String>,

    #[serde(default)]
    pub sync_standby_names: Vec<String>,

    /// File pushed to standbys that ask for the primary's configuration.
    #[serde(default)]
    pub config_file: Option<String>,

    /// Minimum severity written by the logger.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub spi: SpiConfig,
}

fn default_listen_addr() -> String {
    "127.0.0.1:5433".to_string()
}
fn default_node_name() -> String {
    "aerorepl".to_string()
}
fn default_server_mode() -> String {
    "primary".to_string()
}
fn default_one() -> u32 {
    1
}
fn default_sender_timeout_ms() -> u64 {
    6000
}
fn default_log_control_step_ms() -> u64 {
    200
}
fn default_log_control_max_sleep_ms() -> u64 {
    1000
}
fn default_max_send_size() -> u64 {
    DEFAULT_MAX_SEND_SIZE
}
fn default_segment_size() -> u64 {
    DEFAULT_SEGMENT_SIZE
}
fn default_keep_segments() -> u64 {
    16
}
fn default_true() -> bool {
    true
}
fn default_max_senders() -> usize {
    8
}
fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> CliResult<Self> {
        let config: ServerConfig = serde_json::from_str(content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> CliResult<()> {
        if self.log_dir.is_empty() {
            return Err(CliError::config_error("log_dir must not be empty"));
        }
        if self.listen_addr.is_empty() {
            return Err(CliError::config_error("listen_addr must not be empty"));
        }
        self.log_severity()?;
        self.spi.validate().map_err(CliError::config_error)?;
        self.to_sender_config()?
            .validate()
            .map_err(|e| CliError::config_error(format!("Sender config error: {}", e.message)))?;
        Ok(())
    }

    pub fn log_severity(&self) -> CliResult<Severity> {
        Severity::parse(&self.log_level).ok_or_else(|| {
            CliError::config_error(format!("Invalid log_level: '{}'", self.log_level))
        })
    }

    pub fn log_path(&self) -> &Path {
        Path::new(&self.log_dir)
    }

    pub fn slot_path(&self) -> Option<&Path> {
        self.slot_dir.as_deref().map(Path::new)
    }

    pub fn to_sender_config(&self) -> CliResult<SenderConfig> {
        let server_mode = ServerMode::parse(&self.server_mode).ok_or_else(|| {
            CliError::config_error(format!(
                "Invalid server_mode: '{}'. Must be 'primary', 'standby', 'cascade', 'pending' or 'normal'.",
                self.server_mode
            ))
        })?;
        let mut config = SenderConfig::primary();
        if let Some(id) = &self.system_id {
            config.system_id = id.clone();
        }
        config.node_name = self.node_name.clone();
        config.database = self.database.clone();
        config.server_mode = server_mode;
        config.term = self.term;
        config.sender_timeout = Duration::from_millis(self.sender_timeout_ms);
        config.target_rto_secs = self.target_rto_secs;
        config.log_control.step = Duration::from_millis(self.log_control_step_ms);
        config.log_control.max_sleep = Duration::from_millis(self.log_control_max_sleep_ms);
        config.max_send_size = self.max_send_size;
        config.segment_size = self.segment_size;
        config.keep_segments = self.keep_segments;
        config.stream_replication_enabled = self.stream_replication_enabled;
        config.max_senders = self.max_senders;
        config.replication_channels = self.replication_channels.clone();
        config.sync_standby_names = self.sync_standby_names.clone();
        config.config_file = self.config_file.as_ref().map(PathBuf::from);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = ServerConfig::from_json(r#"{"log_dir": "/var/lib/aerorepl/log"}"#).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:5433");
        assert_eq!(config.max_senders, 8);
        assert_eq!(config.spi, SpiConfig::default());

        let sender = config.to_sender_config().unwrap();
        assert_eq!(sender.server_mode, ServerMode::Primary);
        assert_eq!(sender.sender_timeout, Duration::from_secs(6));
        assert!(!sender.system_id.is_empty());
    }

    #[test]
    fn test_overrides_reach_sender_config() {
        let config = ServerConfig::from_json(
            r#"{
                "log_dir": "log",
                "system_id": "7001",
                "server_mode": "standby",
                "sender_timeout_ms": 0,
                "target_rto_secs": 30,
                "log_control_step_ms": 50,
                "sync_standby_names": ["s1", "*"],
                "spi": {"work_mem_limit": 65536}
            }"#,
        )
        .unwrap();
        let sender = config.to_sender_config().unwrap();
        assert_eq!(sender.system_id, "7001");
        assert_eq!(sender.server_mode, ServerMode::Standby);
        assert!(!sender.timeout_enabled());
        assert_eq!(sender.target_rto_secs, 30);
        assert_eq!(sender.log_control.step, Duration::from_millis(50));
        assert_eq!(sender.log_control.max_sleep, Duration::from_secs(1));
        assert_eq!(sender.sync_priority("s1"), 1);
        assert_eq!(config.spi.work_mem_limit, 65536);
        assert_eq!(config.spi.tuptable_size, 128);
    }

    #[test]
    fn test_rejects_bad_values() {
        for json in [
            r#"{"log_dir": ""}"#,
            r#"{"log_dir": "log", "server_mode": "leader"}"#,
            r#"{"log_dir": "log", "max_senders": 0}"#,
            r#"{"log_dir": "log", "segment_size": 1000}"#,
            r#"{"log_dir": "log", "log_level": "loud"}"#,
            r#"{"log_dir": "log", "log_control_step_ms": 500, "log_control_max_sleep_ms": 100}"#,
            r#"{"max_senders": 2}"#,
        ] {
            let err = ServerConfig::from_json(json).unwrap_err();
            assert_eq!(err.code_str(), "AERO_CLI_CONFIG_ERROR", "{}", json);
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aerorepl.json");
        fs::write(&path, r#"{"log_dir": "log", "slot_dir": "slots"}"#).unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.slot_path(), Some(Path::new("slots")));
        assert!(ServerConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
