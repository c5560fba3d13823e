//! Sender state machine and peer role vocabulary
//!
//! States only move forward:
//!
//! ```text
//! Startup ──► Backup
//!    │
//!    └──────► Catchup ──► Streaming
//! ```
//!
//! A reconnecting peer gets a new session starting at `Startup`.

use serde::Serialize;

use super::errors::{ReplicationError, ReplicationResult};

/// Sender session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WalSndState {
    /// Handshake in progress
    Startup,
    /// Serving a base backup
    Backup,
    /// Draining backlog toward the flush point
    Catchup,
    /// Tracking live writes
    Streaming,
}

impl WalSndState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalSndState::Startup => "Startup",
            WalSndState::Backup => "Backup",
            WalSndState::Catchup => "Catchup",
            WalSndState::Streaming => "Streaming",
        }
    }

    /// Move to `next`, refusing any backwards or sideways step.
    pub fn transition(self, next: WalSndState) -> ReplicationResult<Self> {
        use WalSndState::*;
        match (self, next) {
            (a, b) if a == b => Ok(a),
            (Startup, Backup) | (Startup, Catchup) | (Catchup, Streaming) => Ok(next),
            _ => Err(ReplicationError::illegal_transition(format!(
                "cannot move sender from {} to {}",
                self.as_str(),
                next.as_str()
            ))),
        }
    }
}

/// What kind of peer the session serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SenderRole {
    /// Primary to a regular standby
    Standby,
    /// Primary to a standby being rebuilt; longer handshake timeout
    BuildStandby,
    /// Primary to a log-only dummy standby
    DummyStandby,
    /// Dummy standby replaying its stored log to a standby
    DummyToStandby,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Standby => "STANDBY",
            SenderRole::BuildStandby => "BUILD_STANDBY",
            SenderRole::DummyStandby => "DUMMYSTANDBY",
            SenderRole::DummyToStandby => "DSTANDBY",
        }
    }

    /// Parse the `sender_role` startup parameter. Absent means a standby.
    pub fn from_param(value: Option<&str>) -> ReplicationResult<Self> {
        match value.map(|v| v.to_ascii_lowercase()) {
            None => Ok(SenderRole::Standby),
            Some(v) => match v.as_str() {
                "standby" => Ok(SenderRole::Standby),
                "build" | "buildstandby" => Ok(SenderRole::BuildStandby),
                "dummy" | "dummystandby" => Ok(SenderRole::DummyStandby),
                "dstandby" => Ok(SenderRole::DummyToStandby),
                other => Err(ReplicationError::protocol_violation(format!(
                    "invalid sender_role \"{}\"",
                    other
                ))),
            },
        }
    }

    /// Sender timeout multiplier, applied in the handshake and while streaming.
    pub fn timeout_factor(&self) -> u32 {
        match self {
            SenderRole::BuildStandby => 4,
            _ => 1,
        }
    }
}

/// Server mode reported to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerMode {
    Unknown = 0,
    Normal = 1,
    Primary = 2,
    Standby = 3,
    Pending = 4,
    Cascade = 5,
}

impl ServerMode {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ServerMode::Normal,
            2 => ServerMode::Primary,
            3 => ServerMode::Standby,
            4 => ServerMode::Pending,
            5 => ServerMode::Cascade,
            _ => ServerMode::Unknown,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "normal" => Some(ServerMode::Normal),
            "primary" => Some(ServerMode::Primary),
            "standby" => Some(ServerMode::Standby),
            "pending" => Some(ServerMode::Pending),
            "cascade" => Some(ServerMode::Cascade),
            _ => None,
        }
    }
}

/// Database state reported alongside the server mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DbState {
    Unknown = 0,
    Normal = 1,
    NeedRepair = 2,
    Starting = 3,
    Demoting = 4,
    Promoting = 5,
    Building = 6,
    Catchup = 7,
}

impl DbState {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => DbState::Normal,
            2 => DbState::NeedRepair,
            3 => DbState::Starting,
            4 => DbState::Demoting,
            5 => DbState::Promoting,
            6 => DbState::Building,
            7 => DbState::Catchup,
            _ => DbState::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let s = WalSndState::Startup;
        let s = s.transition(WalSndState::Catchup).unwrap();
        let s = s.transition(WalSndState::Streaming).unwrap();
        assert_eq!(s, WalSndState::Streaming);
        assert_eq!(s.transition(WalSndState::Streaming).unwrap(), s);
    }

    #[test]
    fn test_backward_transitions_rejected() {
        assert!(WalSndState::Streaming.transition(WalSndState::Catchup).is_err());
        assert!(WalSndState::Catchup.transition(WalSndState::Startup).is_err());
        assert!(WalSndState::Backup.transition(WalSndState::Streaming).is_err());
    }

    #[test]
    fn test_role_param_parsing() {
        assert_eq!(SenderRole::from_param(None).unwrap(), SenderRole::Standby);
        assert_eq!(
            SenderRole::from_param(Some("BUILD")).unwrap(),
            SenderRole::BuildStandby
        );
        assert!(SenderRole::from_param(Some("bogus")).is_err());
        assert_eq!(SenderRole::BuildStandby.timeout_factor(), 4);
    }

    #[test]
    fn test_mode_codes_round_trip() {
        for mode in [ServerMode::Normal, ServerMode::Primary, ServerMode::Standby] {
            assert_eq!(ServerMode::from_code(mode.code()), mode);
        }
        assert_eq!(ServerMode::from_code(99), ServerMode::Unknown);
    }
}
