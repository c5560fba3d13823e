//! CLI module for aerorepl
//!
//! Provides command-line interface for:
//! - serve: Run the replication listener
//! - check-config: Validate a configuration file
//! - lsn: Inspect a log position
//! - exec: Run statements through the procedure call stack

mod args;
mod commands;
mod config;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{check_config, exec, lsn, run_command, serve};
pub use config::ServerConfig;
pub use errors::{CliError, CliErrorCode, CliResult};

/// Parse arguments and run the selected command.
pub fn run() -> CliResult<()> {
    run_command(Cli::parse_args().command)
}
