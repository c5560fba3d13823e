//! CLI argument definitions using clap
//!
//! Commands:
//! - aerorepl serve --config <path>
//! - aerorepl check-config --config <path>
//! - aerorepl lsn <X/X> [--segment-size <bytes>]
//! - aerorepl exec [--read-only] [--limit <n>] [SQL]...

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::wal::DEFAULT_SEGMENT_SIZE;

/// aerorepl - log shipping sender and procedure call stack
#[derive(Parser, Debug)]
#[command(name = "aerorepl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve standbys and logical consumers until Ctrl-C
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./aerorepl.json")]
        config: PathBuf,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./aerorepl.json")]
        config: PathBuf,
    },

    /// Show segment information for a log position
    Lsn {
        /// Position in X/X form
        position: String,

        /// Segment size in bytes
        #[arg(long, default_value_t = DEFAULT_SEGMENT_SIZE)]
        segment_size: u64,
    },

    /// Run statements through the call stack against an in-memory engine
    ///
    /// Statements are taken from the arguments, or one per line from stdin
    /// when none are given.
    Exec {
        /// Statements to run in order
        sql: Vec<String>,

        /// Reject statements that modify data
        #[arg(long)]
        read_only: bool,

        /// Maximum rows per statement, 0 for all
        #[arg(long, default_value_t = 0)]
        limit: i64,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exec() {
        let cli = Cli::try_parse_from([
            "aerorepl",
            "exec",
            "--read-only",
            "--limit",
            "5",
            "select * from t",
        ])
        .unwrap();
        match cli.command {
            Command::Exec {
                sql,
                read_only,
                limit,
            } => {
                assert_eq!(sql, vec!["select * from t".to_string()]);
                assert!(read_only);
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_lsn_default_segment_size() {
        let cli = Cli::try_parse_from(["aerorepl", "lsn", "0/16B3740"]).unwrap();
        match cli.command {
            Command::Lsn {
                position,
                segment_size,
            } => {
                assert_eq!(position, "0/16B3740");
                assert_eq!(segment_size, DEFAULT_SEGMENT_SIZE);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
