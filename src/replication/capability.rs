//! Negotiated protocol capabilities
//!
//! The peer announces its replication protocol version in the startup
//! packet (`replication_protocol`). It is resolved into this table once,
//! and message construction sites branch on the table instead of the raw
//! number.

use super::errors::{ReplicationError, ReplicationResult};

/// Protocol version this sender speaks.
pub const CURRENT_PROTOCOL_VERSION: u32 = 92_100;

/// First version that expects the three-column IDENTIFY_CONSISTENCY reply.
pub const EXTENDED_CONSISTENCY_SINCE: u32 = 92_060;

/// Oldest version still served.
pub const MIN_PROTOCOL_VERSION: u32 = 92_000;

/// Shape of the IDENTIFY_CONSISTENCY result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyReply {
    /// `reccrc`, `havexlog`
    Legacy,
    /// `reqcrc`, `maxlsn`, `maxcrc`
    Extended,
}

/// Capability table for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolCapabilities {
    pub version: u32,
    pub consistency_reply: ConsistencyReply,
}

impl ProtocolCapabilities {
    pub fn for_version(version: u32) -> ReplicationResult<Self> {
        if version < MIN_PROTOCOL_VERSION {
            return Err(ReplicationError::protocol_violation(format!(
                "unsupported replication protocol version {} (minimum {})",
                version, MIN_PROTOCOL_VERSION
            )));
        }
        let consistency_reply = if version >= EXTENDED_CONSISTENCY_SINCE {
            ConsistencyReply::Extended
        } else {
            ConsistencyReply::Legacy
        };
        Ok(Self {
            version,
            consistency_reply,
        })
    }

    /// Resolve from the optional startup parameter. Absent means current.
    pub fn from_param(value: Option<&str>) -> ReplicationResult<Self> {
        match value {
            None => Self::for_version(CURRENT_PROTOCOL_VERSION),
            Some(v) => {
                let version = v.trim().parse::<u32>().map_err(|_| {
                    ReplicationError::protocol_violation(format!(
                        "invalid replication_protocol \"{}\"",
                        v
                    ))
                })?;
                Self::for_version(version)
            }
        }
    }
}

impl Default for ProtocolCapabilities {
    fn default() -> Self {
        Self {
            version: CURRENT_PROTOCOL_VERSION,
            consistency_reply: ConsistencyReply::Extended,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_gate() {
        assert_eq!(
            ProtocolCapabilities::for_version(92_059).unwrap().consistency_reply,
            ConsistencyReply::Legacy
        );
        assert_eq!(
            ProtocolCapabilities::for_version(92_060).unwrap().consistency_reply,
            ConsistencyReply::Extended
        );
    }

    #[test]
    fn test_absent_param_is_current() {
        let caps = ProtocolCapabilities::from_param(None).unwrap();
        assert_eq!(caps, ProtocolCapabilities::default());
    }

    #[test]
    fn test_rejects_ancient_and_garbage() {
        assert!(ProtocolCapabilities::for_version(1).is_err());
        assert!(ProtocolCapabilities::from_param(Some("abc")).is_err());
    }
}
