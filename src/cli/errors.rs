//! Errors surfaced by `aerorepl` commands
//!
//! Every CLI error ends the process with a non-zero status.

use std::fmt;
use std::io;

use crate::replication::ReplicationError;
use crate::spi::SpiError;
use crate::wal::WalError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Config file missing, unreadable or invalid
    ConfigError,
    /// Reading statements or writing results failed
    IoError,
    /// Argument could not be interpreted
    InvalidArgument,
    /// Listener failed to start or stopped abnormally
    ServeFailed,
    /// Statement execution failed
    ExecFailed,
}

impl CliErrorCode {
    /// Stable `AERO_CLI_*` identifier
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "AERO_CLI_CONFIG_ERROR",
            Self::IoError => "AERO_CLI_IO_ERROR",
            Self::InvalidArgument => "AERO_CLI_INVALID_ARGUMENT",
            Self::ServeFailed => "AERO_CLI_SERVE_FAILED",
            Self::ExecFailed => "AERO_CLI_EXEC_FAILED",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InvalidArgument, msg)
    }

    pub fn serve_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ServeFailed, msg)
    }

    pub fn exec_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ExecFailed, msg)
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<ReplicationError> for CliError {
    fn from(e: ReplicationError) -> Self {
        Self::serve_failed(e.message)
    }
}

impl From<WalError> for CliError {
    fn from(e: WalError) -> Self {
        Self::serve_failed(e.to_string())
    }
}

impl From<SpiError> for CliError {
    fn from(e: SpiError) -> Self {
        Self::exec_failed(e.to_string())
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::SpiResultCode;

    #[test]
    fn test_display_includes_code() {
        let e = CliError::config_error("listen_addr must not be empty");
        assert_eq!(
            e.to_string(),
            "AERO_CLI_CONFIG_ERROR: listen_addr must not be empty"
        );
    }

    #[test]
    fn test_spi_error_maps_to_exec_failed() {
        let e: CliError = SpiError::Routine(SpiResultCode::ErrorTransaction).into();
        assert_eq!(e.code(), &CliErrorCode::ExecFailed);
        assert_eq!(e.message(), "SPI_ERROR_TRANSACTION");
    }
}
