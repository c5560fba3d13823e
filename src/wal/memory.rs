//! In-memory log
//!
//! Used by tests and embedders that keep their log elsewhere and only
//! need a sender in front of it. Writers append and flush, senders read.

use std::sync::{Mutex, MutexGuard};

use super::errors::{WalError, WalResult};
use super::position::{LogPosition, DEFAULT_SEGMENT_SIZE};
use super::reader::LogReader;

#[derive(Debug)]
struct Inner {
    /// Absolute position of `data[0]`.
    base: u64,
    data: Vec<u8>,
    flushed: u64,
    removed_before: u64,
    checkpoint: Option<LogPosition>,
}

/// A growable log held in memory.
///
/// The log starts at the beginning of segment 1 so that position zero
/// stays invalid.
#[derive(Debug)]
pub struct MemoryLog {
    segment_size: u64,
    timeline: u32,
    inner: Mutex<Inner>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::with_segment_size(DEFAULT_SEGMENT_SIZE)
    }

    pub fn with_segment_size(segment_size: u64) -> Self {
        Self {
            segment_size,
            timeline: 1,
            inner: Mutex::new(Inner {
                base: segment_size,
                data: Vec::new(),
                flushed: segment_size,
                removed_before: segment_size,
                checkpoint: None,
            }),
        }
    }

    pub fn with_timeline(mut self, timeline: u32) -> Self {
        self.timeline = timeline;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append bytes without making them durable. Returns the new end.
    pub fn append(&self, bytes: &[u8]) -> LogPosition {
        let mut inner = self.lock();
        inner.data.extend_from_slice(bytes);
        LogPosition::new(inner.base + inner.data.len() as u64)
    }

    /// Make everything appended so far durable.
    pub fn flush(&self) -> LogPosition {
        let mut inner = self.lock();
        inner.flushed = inner.base + inner.data.len() as u64;
        LogPosition::new(inner.flushed)
    }

    pub fn append_flushed(&self, bytes: &[u8]) -> LogPosition {
        self.append(bytes);
        self.flush()
    }

    /// End of appended (possibly not yet durable) log.
    pub fn write_position(&self) -> LogPosition {
        let inner = self.lock();
        LogPosition::new(inner.base + inner.data.len() as u64)
    }

    /// Drop every whole segment that ends at or before `position`.
    pub fn recycle_before(&self, position: LogPosition) {
        let mut inner = self.lock();
        let cut = position.segment_start(self.segment_size).as_u64();
        if cut > inner.removed_before {
            inner.removed_before = cut.min(inner.flushed);
        }
    }

    pub fn set_checkpoint(&self, position: LogPosition) {
        self.lock().checkpoint = Some(position);
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogReader for MemoryLog {
    fn flushed_position(&self) -> LogPosition {
        LogPosition::new(self.lock().flushed)
    }

    fn oldest_position(&self) -> LogPosition {
        let inner = self.lock();
        LogPosition::new(inner.base.max(inner.removed_before))
    }

    fn read(&self, start: LogPosition, len: u64) -> WalResult<Vec<u8>> {
        let inner = self.lock();
        let begin = start.as_u64();
        if begin < inner.base.max(inner.removed_before) {
            return Err(WalError::segment_removed(
                &self.segment_name(start),
                start.segment_offset(self.segment_size),
            ));
        }
        let end = begin.saturating_add(len);
        if end > inner.flushed {
            return Err(WalError::beyond_flush(
                LogPosition::new(end),
                LogPosition::new(inner.flushed),
            ));
        }
        let from = (begin - inner.base) as usize;
        let to = (end - inner.base) as usize;
        Ok(inner.data[from..to].to_vec())
    }

    fn segment_size(&self) -> u64 {
        self.segment_size
    }

    fn timeline(&self) -> u32 {
        self.timeline
    }

    fn checkpoint_position(&self) -> Option<LogPosition> {
        self.lock().checkpoint
    }
}
