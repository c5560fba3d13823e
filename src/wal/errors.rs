//! Log reader error types
//!
//! Error codes:
//! - AERO_WAL_SEGMENT_REMOVED (ERROR severity, raises an alarm)
//! - AERO_WAL_READ_FAILED (ERROR severity)
//! - AERO_WAL_INVALID_POSITION (ERROR severity)
//! - AERO_WAL_CORRUPTION (FATAL severity)

use std::fmt;
use std::io;

/// Severity levels for log errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation fails, the caller may retry or resynchronize
    Error,
    /// The log cannot be trusted
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Log error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalErrorCode {
    /// Requested segment is no longer retained
    AeroWalSegmentRemoved,
    /// I/O failure while reading a segment
    AeroWalReadFailed,
    /// Malformed or out-of-range position
    AeroWalInvalidPosition,
    /// Log contents are inconsistent
    AeroWalCorruption,
}

impl WalErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            WalErrorCode::AeroWalSegmentRemoved => "AERO_WAL_SEGMENT_REMOVED",
            WalErrorCode::AeroWalReadFailed => "AERO_WAL_READ_FAILED",
            WalErrorCode::AeroWalInvalidPosition => "AERO_WAL_INVALID_POSITION",
            WalErrorCode::AeroWalCorruption => "AERO_WAL_CORRUPTION",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            WalErrorCode::AeroWalCorruption => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for WalErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Log error with enough context (segment file, offset) for an operator.
#[derive(Debug)]
pub struct WalError {
    code: WalErrorCode,
    message: String,
    details: Option<String>,
    source: Option<io::Error>,
}

impl WalError {
    /// The peer asked for a segment that has been recycled.
    pub fn segment_removed(segment_name: &str, offset: u64) -> Self {
        Self {
            code: WalErrorCode::AeroWalSegmentRemoved,
            message: format!(
                "requested WAL segment {} has already been removed",
                segment_name
            ),
            details: Some(format!("segment: {}, byte_offset: {}", segment_name, offset)),
            source: None,
        }
    }

    pub fn read_failed(segment_name: &str, offset: u64, source: io::Error) -> Self {
        Self {
            code: WalErrorCode::AeroWalReadFailed,
            message: format!("could not read from log segment {}", segment_name),
            details: Some(format!("segment: {}, byte_offset: {}", segment_name, offset)),
            source: Some(source),
        }
    }

    pub fn invalid_position(text: impl Into<String>) -> Self {
        Self {
            code: WalErrorCode::AeroWalInvalidPosition,
            message: format!("invalid log position \"{}\"", text.into()),
            details: None,
            source: None,
        }
    }

    /// A range was requested beyond the durable end of the log.
    pub fn beyond_flush(requested: impl fmt::Display, flushed: impl fmt::Display) -> Self {
        Self {
            code: WalErrorCode::AeroWalInvalidPosition,
            message: format!(
                "requested starting point {} is ahead of the log flush position {}",
                requested, flushed
            ),
            details: None,
            source: None,
        }
    }

    /// A segment older than the newest ended before `segment_size` bytes.
    pub fn segment_truncated(segment_name: &str, offset: u64) -> Self {
        Self {
            code: WalErrorCode::AeroWalCorruption,
            message: format!("log segment {} is shorter than a full segment", segment_name),
            details: Some(format!("segment: {}, byte_offset: {}", segment_name, offset)),
            source: None,
        }
    }

    pub fn code(&self) -> WalErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Whether an operator alarm should accompany this error.
    pub fn raises_alarm(&self) -> bool {
        self.code == WalErrorCode::AeroWalSegmentRemoved
    }
}

impl fmt::Display for WalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code.code(),
            self.message
        )?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for log operations
pub type WalResult<T> = Result<T, WalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_removed_message_and_alarm() {
        let err = WalError::segment_removed("000000010000000000000003", 42);
        assert_eq!(err.code(), WalErrorCode::AeroWalSegmentRemoved);
        assert!(err.raises_alarm());
        assert!(!err.is_fatal());
        assert_eq!(
            err.message(),
            "requested WAL segment 000000010000000000000003 has already been removed"
        );
        assert!(err.details().unwrap().contains("byte_offset: 42"));
    }

    #[test]
    fn test_truncated_segment_is_fatal() {
        let err = WalError::segment_truncated("000000010000000000000002", 4000);
        assert!(err.is_fatal());
        assert!(!err.raises_alarm());
        let display = format!("{}", err);
        assert!(display.starts_with("[FATAL] AERO_WAL_CORRUPTION: log segment"));
        assert!(display.contains("byte_offset: 4000"));
    }

    #[test]
    fn test_read_failed_keeps_source() {
        use std::error::Error;
        let err = WalError::read_failed("seg", 0, io::Error::new(io::ErrorKind::Other, "disk"));
        assert!(err.source().is_some());
        assert!(!err.raises_alarm());
    }
}
