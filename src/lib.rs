//! aerorepl - log shipping sender and nested procedure call stack
//!
//! - [`replication`]: sessions that stream the durable log to standbys and
//!   logical consumers, with adaptive pacing
//! - [`spi`]: the frame stack procedures use to run queries, with plans,
//!   cursors and result tables
//! - [`wal`]: read access to the durable log
//! - [`observability`]: structured logging and sender metrics

pub mod cli;
pub mod observability;
pub mod replication;
pub mod spi;
pub mod wal;
