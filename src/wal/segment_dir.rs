//! Read-only log over a directory of segment files
//!
//! Segment files are named by [`segment_file_name`] and hold exactly
//! `segment_size` bytes once complete. The newest file may be partial; its
//! length is the durable end of the log.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::errors::{WalError, WalResult};
use super::position::{parse_segment_file_name, segment_file_name, LogPosition};
use super::reader::LogReader;

/// Log reader over `<dir>/<segment files>`.
#[derive(Debug, Clone)]
pub struct SegmentDirLog {
    dir: PathBuf,
    segment_size: u64,
    timeline: u32,
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    first_segno: u64,
    last_segno: u64,
    last_len: u64,
}

impl SegmentDirLog {
    pub fn open(dir: &Path, segment_size: u64, timeline: u32) -> WalResult<Self> {
        fs::read_dir(dir).map_err(|e| WalError::read_failed(&dir.display().to_string(), 0, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            segment_size,
            timeline,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn extent(&self) -> Option<Extent> {
        let entries = fs::read_dir(&self.dir).ok()?;
        let mut first: Option<u64> = None;
        let mut last: Option<(u64, u64)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((timeline, segno)) = parse_segment_file_name(name, self.segment_size) else {
                continue;
            };
            if timeline != self.timeline {
                continue;
            }
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            first = Some(first.map_or(segno, |f| f.min(segno)));
            if last.map_or(true, |(l, _)| segno > l) {
                last = Some((segno, len.min(self.segment_size)));
            }
        }
        let first_segno = first?;
        let (last_segno, last_len) = last?;
        Some(Extent {
            first_segno,
            last_segno,
            last_len,
        })
    }

    fn segment_path(&self, segno: u64) -> PathBuf {
        self.dir
            .join(segment_file_name(self.timeline, segno, self.segment_size))
    }
}

impl LogReader for SegmentDirLog {
    fn flushed_position(&self) -> LogPosition {
        match self.extent() {
            Some(ext) => LogPosition::new(ext.last_segno * self.segment_size + ext.last_len),
            None => LogPosition::INVALID,
        }
    }

    fn oldest_position(&self) -> LogPosition {
        match self.extent() {
            Some(ext) => LogPosition::new(ext.first_segno * self.segment_size),
            None => LogPosition::INVALID,
        }
    }

    fn read(&self, start: LogPosition, len: u64) -> WalResult<Vec<u8>> {
        let flushed = self.flushed_position();
        let end = start.advance(len);
        if end > flushed {
            return Err(WalError::beyond_flush(end, flushed));
        }

        let mut out = Vec::with_capacity(len as usize);
        let mut cursor = start;
        while cursor < end {
            let segno = cursor.segment_no(self.segment_size);
            let offset = cursor.segment_offset(self.segment_size);
            let chunk = (self.segment_size - offset).min(end.distance_from(cursor));
            let name = segment_file_name(self.timeline, segno, self.segment_size);

            let mut file = match File::open(self.segment_path(segno)) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(WalError::segment_removed(&name, offset));
                }
                Err(e) => return Err(WalError::read_failed(&name, offset, e)),
            };
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| WalError::read_failed(&name, offset, e))?;
            let mut buf = vec![0u8; chunk as usize];
            file.read_exact(&mut buf).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    WalError::segment_truncated(&name, offset)
                } else {
                    WalError::read_failed(&name, offset, e)
                }
            })?;
            out.extend_from_slice(&buf);
            cursor = cursor.advance(chunk);
        }
        Ok(out)
    }

    fn segment_size(&self) -> u64 {
        self.segment_size
    }

    fn timeline(&self) -> u32 {
        self.timeline
    }
}
