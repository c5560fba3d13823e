//! Replication error types
//!
//! Every error here ends at most one session. None of them stop the
//! process or other sessions.
//!
//! - Protocol violations are fatal to the session
//! - Timeouts are fatal to the session
//! - Missing segments are retryable by the peer (resync from archive)

use std::fmt;
use std::io;

use crate::wal::WalError;

/// Replication error type
#[derive(Debug, Clone)]
pub struct ReplicationError {
    /// Error kind
    pub kind: ReplicationErrorKind,
    /// Error message
    pub message: String,
}

/// Replication error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationErrorKind {
    /// Malformed or unexpected peer input
    ProtocolViolation,
    /// No message from the peer within the sender timeout
    Timeout,
    /// Peer closed the connection
    PeerClosed,
    /// Transport read or write failed
    Io,
    /// The peer needs log that is no longer retained
    MissingSegment,
    /// Slot lookup, creation, or persistence failed
    Slot,
    /// Invalid configuration
    ConfigurationError,
    /// State machine asked to move backwards
    IllegalTransition,
    /// Switchover aborted
    Switchover,
    /// Too many concurrent sessions
    TooManySenders,
    /// A well-formed command that cannot be served in the current state
    InvalidRequest,
    /// Log could not be read for another reason
    Log,
}

impl ReplicationError {
    pub fn new(kind: ReplicationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::ProtocolViolation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Timeout, message)
    }

    pub fn peer_closed(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::PeerClosed, message)
    }

    pub fn io(context: &str, err: &io::Error) -> Self {
        Self::new(ReplicationErrorKind::Io, format!("{}: {}", context, err))
    }

    pub fn slot(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Slot, message)
    }

    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::ConfigurationError, message)
    }

    pub fn illegal_transition(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::IllegalTransition, message)
    }

    pub fn switchover(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Switchover, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::InvalidRequest, message)
    }

    pub fn too_many_senders(max: usize) -> Self {
        Self::new(
            ReplicationErrorKind::TooManySenders,
            format!(
                "number of requested standby connections exceeds max_wal_senders (currently {})",
                max
            ),
        )
    }

    /// Whether this error ends the session.
    ///
    /// Slot, configuration and request errors during the handshake leave
    /// the connection usable; they are reported to the peer as error
    /// responses.
    pub fn closes_session(&self) -> bool {
        !matches!(
            self.kind,
            ReplicationErrorKind::Slot
                | ReplicationErrorKind::ConfigurationError
                | ReplicationErrorKind::InvalidRequest
        )
    }

    /// SQLSTATE sent with an error response.
    pub fn sqlstate(&self) -> &'static str {
        match self.kind {
            ReplicationErrorKind::ProtocolViolation => "08P01",
            ReplicationErrorKind::ConfigurationError => "22023",
            ReplicationErrorKind::Slot | ReplicationErrorKind::InvalidRequest => "55000",
            ReplicationErrorKind::TooManySenders => "53300",
            ReplicationErrorKind::MissingSegment | ReplicationErrorKind::Io => "58P01",
            _ => "XX000",
        }
    }

    /// Whether the peer may recover by resynchronizing from elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ReplicationErrorKind::MissingSegment
                | ReplicationErrorKind::Timeout
                | ReplicationErrorKind::PeerClosed
        )
    }

    /// Violations of the protocol or of state machine invariants.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ReplicationErrorKind::ProtocolViolation | ReplicationErrorKind::IllegalTransition
        )
    }
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicationError({:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for ReplicationError {}

impl From<WalError> for ReplicationError {
    fn from(err: WalError) -> Self {
        let kind = if err.raises_alarm() {
            ReplicationErrorKind::MissingSegment
        } else {
            ReplicationErrorKind::Log
        };
        Self::new(kind, err.to_string())
    }
}

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(ReplicationError::protocol_violation("x").is_fatal());
        assert!(ReplicationError::illegal_transition("x").is_fatal());
        assert!(!ReplicationError::timeout("x").is_fatal());
    }

    #[test]
    fn test_session_ending_errors() {
        assert!(ReplicationError::timeout("x").closes_session());
        assert!(ReplicationError::protocol_violation("x").closes_session());
        assert!(!ReplicationError::slot("x").closes_session());
    }

    #[test]
    fn test_removed_segment_maps_to_missing_segment() {
        let err: ReplicationError = WalError::segment_removed("000000010000000000000002", 0).into();
        assert_eq!(err.kind, ReplicationErrorKind::MissingSegment);
        assert!(err.is_retryable());
        assert!(err.message.contains("has already been removed"));
    }

    #[test]
    fn test_too_many_senders_message() {
        let err = ReplicationError::too_many_senders(4);
        assert!(err.message.contains("max_wal_senders (currently 4)"));
    }
}
