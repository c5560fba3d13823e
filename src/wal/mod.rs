//! Durable log access for the sender
//!
//! The on-disk record format belongs to the storage engine. This module
//! only knows positions, segments, and byte ranges.
//!
//! # Invariants Enforced
//!
//! - Only flushed bytes are readable
//! - Positions render as `%X/%X`
//! - Recycled segments are reported, never silently skipped

mod checksum;
mod errors;
mod memory;
mod position;
mod reader;
mod segment_dir;

pub use checksum::{compute_checksum, consistency_checksum, CONSISTENCY_WINDOW};
pub use errors::{Severity, WalError, WalErrorCode, WalResult};
pub use memory::MemoryLog;
pub use position::{
    parse_segment_file_name, segment_file_name, LogPosition, DEFAULT_SEGMENT_SIZE, PAGE_SIZE,
};
pub use reader::LogReader;
pub use segment_dir::SegmentDirLog;
