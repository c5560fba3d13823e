//! Log positions and segment arithmetic
//!
//! A log position is a byte offset into the durable change log. It is
//! rendered as two 32-bit hexadecimal halves (`16/B374D848`), the format
//! every replication command and reply uses on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::{WalError, WalResult};

/// Default segment size (16 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Log page size. Sends that stop short of the flush point end on a page boundary.
pub const PAGE_SIZE: u64 = 8192;

/// A position in the durable log.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogPosition(u64);

impl LogPosition {
    /// The invalid position. Nothing is ever written at zero.
    pub const INVALID: LogPosition = LogPosition(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw byte offset.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// High 32 bits, the part before the slash.
    pub fn high(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Low 32 bits, the part after the slash.
    pub fn low(&self) -> u32 {
        self.0 as u32
    }

    /// Number of bytes from `earlier` up to `self`, zero if `earlier` is ahead.
    pub fn distance_from(&self, earlier: LogPosition) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn advance(&self, bytes: u64) -> Self {
        Self(self.0.saturating_add(bytes))
    }

    /// Segment number containing this position.
    pub fn segment_no(&self, segment_size: u64) -> u64 {
        self.0 / segment_size
    }

    /// Offset of this position inside its segment.
    pub fn segment_offset(&self, segment_size: u64) -> u64 {
        self.0 % segment_size
    }

    /// First position of the segment containing this position.
    pub fn segment_start(&self, segment_size: u64) -> Self {
        Self(self.0 - self.segment_offset(segment_size))
    }

    pub fn is_segment_boundary(&self, segment_size: u64) -> bool {
        self.segment_offset(segment_size) == 0
    }

    /// Round down to the start of the page.
    pub fn page_floor(&self, page_size: u64) -> Self {
        Self(self.0 - self.0 % page_size)
    }

    /// Parse the `%X/%X` form.
    pub fn parse(text: &str) -> WalResult<Self> {
        let (hi, lo) = text
            .trim()
            .split_once('/')
            .ok_or_else(|| WalError::invalid_position(text))?;
        if hi.is_empty() || lo.is_empty() || hi.len() > 8 || lo.len() > 8 {
            return Err(WalError::invalid_position(text));
        }
        let hi = u32::from_str_radix(hi, 16).map_err(|_| WalError::invalid_position(text))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| WalError::invalid_position(text))?;
        Ok(Self(((hi as u64) << 32) | lo as u64))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.high(), self.low())
    }
}

impl FromStr for LogPosition {
    type Err = WalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<u64> for LogPosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// File name of a log segment: timeline, then the segment number split
/// into a high "log id" and a low "segment within log id" part.
pub fn segment_file_name(timeline: u32, segno: u64, segment_size: u64) -> String {
    let per_id = 0x1_0000_0000u64 / segment_size;
    format!(
        "{:08X}{:08X}{:08X}",
        timeline,
        segno / per_id,
        segno % per_id
    )
}

/// Inverse of [`segment_file_name`]. Returns `(timeline, segno)`.
pub fn parse_segment_file_name(name: &str, segment_size: u64) -> Option<(u32, u64)> {
    if name.len() != 24 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let timeline = u32::from_str_radix(&name[0..8], 16).ok()?;
    let log_id = u64::from_str_radix(&name[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&name[16..24], 16).ok()?;
    let per_id = 0x1_0000_0000u64 / segment_size;
    Some((timeline, log_id * per_id + seg))
}
