//! Log reader collaborator
//!
//! The sender never interprets log contents. It asks the log for its
//! durable end and for byte ranges below it, nothing else.
//!
//! - Only flushed bytes are ever handed out
//! - Ranges that touch a recycled segment fail with `AERO_WAL_SEGMENT_REMOVED`
//! - Reads never block on writers

use super::errors::WalResult;
use super::position::{segment_file_name, LogPosition};

/// Source of durable log bytes.
pub trait LogReader: Send + Sync {
    /// Highest position known to be durable.
    fn flushed_position(&self) -> LogPosition;

    /// Oldest position still retained.
    fn oldest_position(&self) -> LogPosition;

    /// Read `len` bytes starting at `start`.
    ///
    /// The whole range must lie at or below [`LogReader::flushed_position`].
    fn read(&self, start: LogPosition, len: u64) -> WalResult<Vec<u8>>;

    /// Size of one segment in bytes.
    fn segment_size(&self) -> u64;

    /// Timeline the log is currently written on.
    fn timeline(&self) -> u32 {
        1
    }

    /// Redo position of the latest checkpoint, if any.
    fn checkpoint_position(&self) -> Option<LogPosition> {
        None
    }

    /// File name of the segment holding `position`.
    fn segment_name(&self, position: LogPosition) -> String {
        let size = self.segment_size();
        segment_file_name(self.timeline(), position.segment_no(size), size)
    }
}
