//! Logical decoding collaborator
//!
//! Turns ranges of durable log into a stream of change payloads for a
//! logical slot. Output plugins are looked up by name in a
//! [`DecoderRegistry`]. The built-in `raw` plugin hands log bytes through
//! unchanged.

use std::collections::HashMap;

use super::errors::{ReplicationError, ReplicationResult};
use crate::wal::{LogPosition, LogReader, WalResult};

/// One decoded change, covering log `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedChange {
    pub start: LogPosition,
    pub end: LogPosition,
    pub data: Vec<u8>,
}

/// Where decoding becomes consistent, and the snapshot horizon there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistentPoint {
    pub position: LogPosition,
    pub xmin: u64,
}

/// An output plugin instance bound to one session.
pub trait LogicalDecoder: Send {
    fn plugin_name(&self) -> &str;

    /// Apply START_REPLICATION options.
    fn startup(&mut self, options: &[(String, Option<String>)]) -> ReplicationResult<()>;

    /// Find the point from which decoded output is complete.
    fn build_snapshot(&mut self, reader: &dyn LogReader) -> WalResult<ConsistentPoint>;

    /// Decode at most `max_bytes` of log from `from` toward `upto`.
    fn decode(
        &mut self,
        reader: &dyn LogReader,
        from: LogPosition,
        upto: LogPosition,
        max_bytes: u64,
    ) -> WalResult<Vec<DecodedChange>>;
}

/// Pass-through plugin. Option `chunk_size` splits output into pieces.
#[derive(Debug, Clone)]
pub struct RawDecoder {
    chunk_size: u64,
}

impl Default for RawDecoder {
    fn default() -> Self {
        Self { chunk_size: 8192 }
    }
}

impl LogicalDecoder for RawDecoder {
    fn plugin_name(&self) -> &str {
        "raw"
    }

    fn startup(&mut self, options: &[(String, Option<String>)]) -> ReplicationResult<()> {
        for (name, value) in options {
            match (name.as_str(), value.as_deref()) {
                ("chunk_size", Some(v)) => {
                    self.chunk_size = v
                        .parse::<u64>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| {
                            ReplicationError::configuration_error(format!(
                                "invalid value for option \"chunk_size\": \"{}\"",
                                v
                            ))
                        })?;
                }
                (other, v) => {
                    return Err(ReplicationError::configuration_error(format!(
                        "option \"{}\" = \"{}\" is unknown",
                        other,
                        v.unwrap_or("(null)")
                    )))
                }
            }
        }
        Ok(())
    }

    fn build_snapshot(&mut self, reader: &dyn LogReader) -> WalResult<ConsistentPoint> {
        Ok(ConsistentPoint {
            position: reader.flushed_position(),
            xmin: 0,
        })
    }

    fn decode(
        &mut self,
        reader: &dyn LogReader,
        from: LogPosition,
        upto: LogPosition,
        max_bytes: u64,
    ) -> WalResult<Vec<DecodedChange>> {
        let end = upto.min(from.advance(max_bytes));
        if end <= from {
            return Ok(Vec::new());
        }
        let bytes = reader.read(from, end.distance_from(from))?;
        let mut changes = Vec::new();
        let mut pos = from;
        for chunk in bytes.chunks(self.chunk_size as usize) {
            let next = pos.advance(chunk.len() as u64);
            changes.push(DecodedChange {
                start: pos,
                end: next,
                data: chunk.to_vec(),
            });
            pos = next;
        }
        Ok(changes)
    }
}

type DecoderFactory = fn() -> Box<dyn LogicalDecoder>;

/// Output plugins known to the server.
#[derive(Clone)]
pub struct DecoderRegistry {
    plugins: HashMap<String, DecoderFactory>,
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Registry holding the built-in plugins.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("raw", || Box::new(RawDecoder::default()));
        registry
    }

    pub fn register(&mut self, name: &str, factory: DecoderFactory) {
        self.plugins.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str) -> ReplicationResult<Box<dyn LogicalDecoder>> {
        self.plugins
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| {
                ReplicationError::slot(format!("could not access output plugin \"{}\"", name))
            })
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.plugins.keys().collect();
        names.sort();
        f.debug_struct("DecoderRegistry").field("plugins", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::MemoryLog;

    #[test]
    fn test_raw_decoder_chunks_range() {
        let log = MemoryLog::with_segment_size(4096);
        let start = log.flushed_position();
        let end = log.append_flushed(&[7u8; 100]);

        let mut dec = RawDecoder::default();
        dec.startup(&[("chunk_size".into(), Some("40".into()))]).unwrap();
        let changes = dec.decode(&log, start, end, 1000).unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].start, start);
        assert_eq!(changes[2].end, end);
        assert_eq!(changes[2].data.len(), 20);
    }

    #[test]
    fn test_raw_decoder_respects_max_bytes() {
        let log = MemoryLog::with_segment_size(4096);
        let start = log.flushed_position();
        let end = log.append_flushed(&[1u8; 100]);
        let mut dec = RawDecoder::default();
        let changes = dec.decode(&log, start, end, 30).unwrap();
        assert_eq!(changes.last().unwrap().end, start.advance(30));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let mut dec = RawDecoder::default();
        let err = dec
            .startup(&[("pretty".into(), Some("on".into()))])
            .unwrap_err();
        assert!(err.message.contains("is unknown"));
    }

    #[test]
    fn test_unknown_plugin() {
        let reg = DecoderRegistry::with_builtin();
        assert!(reg.create("raw").is_ok());
        assert!(reg.create("wal2json").is_err());
    }
}
