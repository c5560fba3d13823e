//! # Call-stack errors

use thiserror::Error;

use super::codes::SpiResultCode;
use crate::observability::{log_event_with_fields, Event};

/// Result type for call-stack operations
pub type SpiResult<T> = Result<T, SpiError>;

/// Call-stack errors
///
/// `Routine` carries a result code for expected failures such as a bad
/// argument. Every other variant is raised up to the enclosing transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpiError {
    #[error("{0}")]
    Routine(SpiResultCode),

    #[error("data corrupted: {0}")]
    DataCorrupted(String),

    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),

    #[error("invalid cursor definition: {0}")]
    InvalidCursorDefinition(String),

    #[error("invalid cursor state: {0}")]
    InvalidCursorState(String),

    #[error("read-only violation: {0}")]
    ReadOnlyViolation(String),

    #[error("out of memory in {scope}: requested {requested} bytes, limit {limit}")]
    OutOfMemory {
        scope: String,
        requested: u64,
        limit: u64,
    },

    #[error("engine error: {0}")]
    Engine(String),
}

impl SpiError {
    /// Raise a corruption error after logging it with its context.
    pub fn corrupted(message: impl Into<String>, fields: &[(&str, &str)]) -> Self {
        let message = message.into();
        let mut all: Vec<(&str, &str)> = vec![("message", &message)];
        all.extend_from_slice(fields);
        log_event_with_fields(Event::SpiDataCorrupted, &all);
        SpiError::DataCorrupted(message)
    }

    /// Result code of a routine failure.
    pub fn code(&self) -> Option<SpiResultCode> {
        match self {
            SpiError::Routine(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_routine(&self) -> bool {
        matches!(self, SpiError::Routine(_))
    }

    /// Corruption means a bug in the caller, never an operational condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SpiError::DataCorrupted(_))
    }
}

impl From<SpiResultCode> for SpiError {
    fn from(code: SpiResultCode) -> Self {
        SpiError::Routine(code)
    }
}
