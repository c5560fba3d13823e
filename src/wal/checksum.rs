//! CRC32 checksums over log ranges
//!
//! IDENTIFY_CONSISTENCY compares a peer's "last known position + checksum"
//! against the local log. Both sides checksum the same window of bytes
//! ending at the position, so a mismatch means the histories diverged.

use crc32fast::Hasher;

use super::errors::WalResult;
use super::position::LogPosition;
use super::reader::LogReader;

/// Bytes covered by a consistency checksum.
pub const CONSISTENCY_WINDOW: u64 = 512;

pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Checksum of the window of log ending at `position`.
///
/// Returns `None` when the position lies beyond the durable log or before
/// the oldest retained byte, so the caller can answer `NONE`.
pub fn consistency_checksum(
    reader: &dyn LogReader,
    position: LogPosition,
) -> WalResult<Option<u32>> {
    if !position.is_valid() || position > reader.flushed_position() {
        return Ok(None);
    }
    let oldest = reader.oldest_position();
    let start = LogPosition::new(
        position
            .as_u64()
            .saturating_sub(CONSISTENCY_WINDOW)
            .max(oldest.as_u64()),
    );
    if start >= position {
        return Ok(None);
    }
    let bytes = reader.read(start, position.distance_from(start))?;
    Ok(Some(compute_checksum(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::MemoryLog;

    #[test]
    fn test_checksum_deterministic() {
        let data = b"log bytes";
        assert_eq!(compute_checksum(data), compute_checksum(data));
        assert_ne!(compute_checksum(b"a"), compute_checksum(b"b"));
    }

    #[test]
    fn test_consistency_checksum_matches_for_identical_logs() {
        let a = MemoryLog::with_segment_size(4096);
        let b = MemoryLog::with_segment_size(4096);
        a.append_flushed(&[7u8; 3000]);
        b.append_flushed(&[7u8; 3000]);
        let pos = a.flushed_position();
        assert_eq!(
            consistency_checksum(&a, pos).unwrap(),
            consistency_checksum(&b, pos).unwrap()
        );
    }

    #[test]
    fn test_consistency_checksum_detects_divergence() {
        let a = MemoryLog::with_segment_size(4096);
        let b = MemoryLog::with_segment_size(4096);
        a.append_flushed(&[1u8; 1000]);
        b.append_flushed(&[2u8; 1000]);
        let pos = a.flushed_position();
        assert_ne!(
            consistency_checksum(&a, pos).unwrap(),
            consistency_checksum(&b, pos).unwrap()
        );
    }

    #[test]
    fn test_consistency_checksum_none_past_flush() {
        let log = MemoryLog::with_segment_size(4096);
        log.append_flushed(&[0u8; 100]);
        let beyond = log.flushed_position().advance(1);
        assert_eq!(consistency_checksum(&log, beyond).unwrap(), None);
    }
}
