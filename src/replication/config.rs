//! Sender configuration
//!
//! Supplied externally (config file, CLI) and immutable for the lifetime
//! of a session. Every knob has a working default.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use super::errors::{ReplicationError, ReplicationResult};
use super::state::ServerMode;
use crate::wal::{DEFAULT_SEGMENT_SIZE, PAGE_SIZE};

/// Default maximum bytes of log per `'w'` message.
pub const DEFAULT_MAX_SEND_SIZE: u64 = 128 * 1024;

/// Tuning for the adaptive pacing controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogControlTuning {
    /// Fixed sleep adjustment per sample.
    pub step: Duration,
    /// Sleep ceiling.
    pub max_sleep: Duration,
    /// Tolerance band is `target / tolerance_divisor`.
    pub tolerance_divisor: i64,
    /// Upper bound on replies per sampling window.
    pub max_sample_window: u64,
}

impl Default for LogControlTuning {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(200),
            max_sleep: Duration::from_secs(1),
            tolerance_divisor: 10,
            max_sample_window: 3000,
        }
    }
}

/// Sender configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderConfig {
    /// Stable identifier reported by IDENTIFY_SYSTEM.
    pub system_id: String,
    /// Node name reported by IDENTIFY_MAXLSN.
    pub node_name: String,
    /// Database name reported by IDENTIFY_SYSTEM, if connected to one.
    pub database: Option<String>,
    /// Mode reported by IDENTIFY_MODE and in keepalives.
    pub server_mode: ServerMode,
    /// Term reported by IDENTIFY_VERSION.
    pub term: u32,
    /// Liveness timeout. Zero disables timeout handling.
    pub sender_timeout: Duration,
    /// Target recovery-time objective in seconds. Zero disables pacing.
    pub target_rto_secs: i64,
    /// Maximum bytes of log per data message.
    pub max_send_size: u64,
    /// Segment size of the log.
    pub segment_size: u64,
    /// Number of segments kept for lagging peers. Advisory.
    pub keep_segments: u64,
    /// When false, no log is streamed (sessions stay connected).
    pub stream_replication_enabled: bool,
    /// Maximum concurrent sender sessions.
    pub max_senders: usize,
    /// Addresses IDENTIFY_CHANNEL answers true for.
    pub replication_channels: Vec<String>,
    /// Configuration file pushed to standbys on request.
    pub config_file: Option<PathBuf>,
    /// Synchronous-replication priority per application name; absent is async.
    pub sync_standby_names: Vec<String>,
    pub log_control: LogControlTuning,
}

impl SenderConfig {
    /// Defaults for a primary with a freshly generated system id.
    pub fn primary() -> Self {
        Self {
            system_id: Uuid::new_v4().as_u128().to_string(),
            node_name: "aerorepl".to_string(),
            database: None,
            server_mode: ServerMode::Primary,
            term: 1,
            sender_timeout: Duration::from_secs(6),
            target_rto_secs: 0,
            max_send_size: DEFAULT_MAX_SEND_SIZE,
            segment_size: DEFAULT_SEGMENT_SIZE,
            keep_segments: 16,
            stream_replication_enabled: true,
            max_senders: 8,
            replication_channels: Vec::new(),
            config_file: None,
            sync_standby_names: Vec::new(),
            log_control: LogControlTuning::default(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.system_id.is_empty() {
            return Err(ReplicationError::configuration_error(
                "system_id must not be empty",
            ));
        }
        if self.max_senders == 0 {
            return Err(ReplicationError::configuration_error(
                "max_senders must be > 0",
            ));
        }
        if !self.segment_size.is_power_of_two() || self.segment_size < PAGE_SIZE {
            return Err(ReplicationError::configuration_error(format!(
                "segment_size must be a power of two >= {}",
                PAGE_SIZE
            )));
        }
        if self.max_send_size < PAGE_SIZE {
            return Err(ReplicationError::configuration_error(format!(
                "max_send_size must be >= {}",
                PAGE_SIZE
            )));
        }
        if self.target_rto_secs < 0 {
            return Err(ReplicationError::configuration_error(
                "target_rto must be >= 0",
            ));
        }
        if self.log_control.tolerance_divisor <= 0 || self.log_control.max_sample_window == 0 {
            return Err(ReplicationError::configuration_error(
                "log control tuning values must be positive",
            ));
        }
        if self.log_control.step.is_zero() || self.log_control.max_sleep < self.log_control.step {
            return Err(ReplicationError::configuration_error(
                "log control step must be positive and no larger than max_sleep",
            ));
        }
        Ok(())
    }

    /// Page-aligned per-message send size.
    pub fn effective_send_size(&self) -> u64 {
        (self.max_send_size / PAGE_SIZE).max(1) * PAGE_SIZE
    }

    /// Synchronous priority for an application name, 0 meaning async.
    pub fn sync_priority(&self, application_name: &str) -> u32 {
        self.sync_standby_names
            .iter()
            .position(|n| n == "*" || n == application_name)
            .map(|i| i as u32 + 1)
            .unwrap_or(0)
    }

    pub fn timeout_enabled(&self) -> bool {
        !self.sender_timeout.is_zero()
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self::primary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SenderConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_odd_segment_size() {
        let mut cfg = SenderConfig::primary();
        cfg.segment_size = 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_senders() {
        let mut cfg = SenderConfig::primary();
        cfg.max_senders = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_send_size_is_page_aligned() {
        let mut cfg = SenderConfig::primary();
        cfg.max_send_size = PAGE_SIZE * 3 + 17;
        assert_eq!(cfg.effective_send_size(), PAGE_SIZE * 3);
    }

    #[test]
    fn test_sync_priority_by_position() {
        let mut cfg = SenderConfig::primary();
        cfg.sync_standby_names = vec!["east".into(), "west".into()];
        assert_eq!(cfg.sync_priority("east"), 1);
        assert_eq!(cfg.sync_priority("west"), 2);
        assert_eq!(cfg.sync_priority("north"), 0);
    }
}
