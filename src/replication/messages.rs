//! In-stream messages
//!
//! Once streaming starts, both directions exchange CopyData frames whose
//! first payload byte names the message. All integers are big-endian and
//! timestamps are microseconds since the Unix epoch.
//!
//! Sender → standby: `'w'` data, `'k'` keepalive, `'p'` switchover
//! response, `'m'` config push, `'x'` remove-log and `'e'` end-of-log for
//! dummy standbys.
//!
//! Standby → sender: `'r'` status reply, `'h'` hot-standby feedback,
//! `'s'` switchover request, `'A'` config file timestamp.

use super::errors::{ReplicationError, ReplicationResult};
use super::protocol::{MessageBuilder, MessageReader};
use super::state::{DbState, ServerMode};
use crate::wal::LogPosition;

/// `'e'` percent value meaning the dummy standby is fully synced.
pub const SYNC_DUMMY_STANDBY_END: i32 = 100;

/// Header of a `'w'` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalDataHeader {
    pub data_start: LogPosition,
    pub wal_end: LogPosition,
    pub send_time: i64,
    pub sender_sent: LogPosition,
    pub sender_write: LogPosition,
    pub sender_flush: LogPosition,
    pub sender_replay: LogPosition,
    pub catchup: bool,
}

/// Switchover outcome carried by `'p'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchoverResponseKind {
    /// All log shipped; the standby should promote.
    PromoteRequest = 1,
    /// A catchup process is running; demotion refused.
    DemoteCatchupExist = 2,
}

impl SwitchoverResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PromoteRequest => "promote_request",
            Self::DemoteCatchupExist => "demote_catchup_exist",
        }
    }

    fn from_code(code: i32) -> ReplicationResult<Self> {
        match code {
            1 => Ok(Self::PromoteRequest),
            2 => Ok(Self::DemoteCatchupExist),
            other => Err(ReplicationError::protocol_violation(format!(
                "invalid switchover response {}",
                other
            ))),
        }
    }
}

/// Messages the sender writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderMessage {
    WalData {
        header: WalDataHeader,
        data: Vec<u8>,
    },
    Keepalive {
        peer_role: ServerMode,
        peer_state: DbState,
        wal_end: LogPosition,
        send_time: i64,
        reply_requested: bool,
        catchup: bool,
    },
    SwitchoverResponse {
        response: SwitchoverResponseKind,
        wal_end: LogPosition,
        send_time: i64,
    },
    ConfigPush {
        contents: Vec<u8>,
    },
    RemoveLog {
        peer_role: ServerMode,
        peer_state: DbState,
        send_time: i64,
        reply_requested: bool,
    },
    EndLog {
        peer_role: ServerMode,
        peer_state: DbState,
        send_time: i64,
        percent: i32,
    },
}

impl SenderMessage {
    pub fn type_byte(&self) -> u8 {
        match self {
            SenderMessage::WalData { .. } => b'w',
            SenderMessage::Keepalive { .. } => b'k',
            SenderMessage::SwitchoverResponse { .. } => b'p',
            SenderMessage::ConfigPush { .. } => b'm',
            SenderMessage::RemoveLog { .. } => b'x',
            SenderMessage::EndLog { .. } => b'e',
        }
    }

    /// CopyData payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut b = MessageBuilder::new();
        b.put_u8(self.type_byte());
        match self {
            SenderMessage::WalData { header, data } => {
                b.put_u64(header.data_start.as_u64())
                    .put_u64(header.wal_end.as_u64())
                    .put_i64(header.send_time)
                    .put_u64(header.sender_sent.as_u64())
                    .put_u64(header.sender_write.as_u64())
                    .put_u64(header.sender_flush.as_u64())
                    .put_u64(header.sender_replay.as_u64())
                    .put_bool(header.catchup)
                    .put_bytes(data);
            }
            SenderMessage::Keepalive {
                peer_role,
                peer_state,
                wal_end,
                send_time,
                reply_requested,
                catchup,
            } => {
                b.put_i32(peer_role.code())
                    .put_i32(peer_state.code())
                    .put_u64(wal_end.as_u64())
                    .put_i64(*send_time)
                    .put_bool(*reply_requested)
                    .put_bool(*catchup);
            }
            SenderMessage::SwitchoverResponse {
                response,
                wal_end,
                send_time,
            } => {
                b.put_i32(*response as i32)
                    .put_u64(wal_end.as_u64())
                    .put_i64(*send_time);
            }
            SenderMessage::ConfigPush { contents } => {
                b.put_bytes(contents);
            }
            SenderMessage::RemoveLog {
                peer_role,
                peer_state,
                send_time,
                reply_requested,
            } => {
                b.put_i32(peer_role.code())
                    .put_i32(peer_state.code())
                    .put_i64(*send_time)
                    .put_bool(*reply_requested);
            }
            SenderMessage::EndLog {
                peer_role,
                peer_state,
                send_time,
                percent,
            } => {
                b.put_i32(peer_role.code())
                    .put_i32(peer_state.code())
                    .put_i64(*send_time)
                    .put_i32(*percent);
            }
        }
        b.finish()
    }

    /// Decode a CopyData payload written by a sender.
    pub fn decode(payload: &[u8]) -> ReplicationResult<Self> {
        let mut r = MessageReader::new(payload);
        let kind = r.get_u8()?;
        let msg = match kind {
            b'w' => {
                let header = WalDataHeader {
                    data_start: LogPosition::new(r.get_u64()?),
                    wal_end: LogPosition::new(r.get_u64()?),
                    send_time: r.get_i64()?,
                    sender_sent: LogPosition::new(r.get_u64()?),
                    sender_write: LogPosition::new(r.get_u64()?),
                    sender_flush: LogPosition::new(r.get_u64()?),
                    sender_replay: LogPosition::new(r.get_u64()?),
                    catchup: r.get_bool()?,
                };
                SenderMessage::WalData {
                    header,
                    data: r.rest().to_vec(),
                }
            }
            b'k' => SenderMessage::Keepalive {
                peer_role: ServerMode::from_code(r.get_i32()?),
                peer_state: DbState::from_code(r.get_i32()?),
                wal_end: LogPosition::new(r.get_u64()?),
                send_time: r.get_i64()?,
                reply_requested: r.get_bool()?,
                catchup: r.get_bool()?,
            },
            b'p' => SenderMessage::SwitchoverResponse {
                response: SwitchoverResponseKind::from_code(r.get_i32()?)?,
                wal_end: LogPosition::new(r.get_u64()?),
                send_time: r.get_i64()?,
            },
            b'm' => SenderMessage::ConfigPush {
                contents: r.rest().to_vec(),
            },
            b'x' => SenderMessage::RemoveLog {
                peer_role: ServerMode::from_code(r.get_i32()?),
                peer_state: DbState::from_code(r.get_i32()?),
                send_time: r.get_i64()?,
                reply_requested: r.get_bool()?,
            },
            b'e' => SenderMessage::EndLog {
                peer_role: ServerMode::from_code(r.get_i32()?),
                peer_state: DbState::from_code(r.get_i32()?),
                send_time: r.get_i64()?,
                percent: r.get_i32()?,
            },
            other => {
                return Err(ReplicationError::protocol_violation(format!(
                    "unexpected sender message type \"{}\"",
                    other as char
                )))
            }
        };
        Ok(msg)
    }
}

/// Status reply from the standby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyReply {
    pub receive: LogPosition,
    pub write: LogPosition,
    pub flush: LogPosition,
    pub apply: LogPosition,
    pub peer_role: ServerMode,
    pub peer_state: DbState,
    pub send_time: i64,
    pub reply_requested: bool,
}

/// Switchover modes a standby may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DemoteMode {
    NoDemote = 0,
    Smart = 1,
    Fast = 2,
}

impl DemoteMode {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(DemoteMode::NoDemote),
            1 => Some(DemoteMode::Smart),
            2 => Some(DemoteMode::Fast),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DemoteMode::NoDemote => "no",
            DemoteMode::Smart => "smart",
            DemoteMode::Fast => "fast",
        }
    }
}

/// Messages a standby writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StandbyMessage {
    Reply(StandbyReply),
    HotStandbyFeedback { send_time: i64, xmin: u64 },
    /// `demote_mode` is kept raw so out-of-range values can be reported.
    SwitchoverRequest { demote_mode: i32, send_time: i64 },
    ConfigModifyTime { mtime: i64 },
}

impl StandbyMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut b = MessageBuilder::new();
        match self {
            StandbyMessage::Reply(reply) => {
                b.put_u8(b'r')
                    .put_u64(reply.receive.as_u64())
                    .put_u64(reply.write.as_u64())
                    .put_u64(reply.flush.as_u64())
                    .put_u64(reply.apply.as_u64())
                    .put_i32(reply.peer_role.code())
                    .put_i32(reply.peer_state.code())
                    .put_i64(reply.send_time)
                    .put_bool(reply.reply_requested);
            }
            StandbyMessage::HotStandbyFeedback { send_time, xmin } => {
                b.put_u8(b'h').put_i64(*send_time).put_u64(*xmin);
            }
            StandbyMessage::SwitchoverRequest {
                demote_mode,
                send_time,
            } => {
                b.put_u8(b's').put_i32(*demote_mode).put_i64(*send_time);
            }
            StandbyMessage::ConfigModifyTime { mtime } => {
                b.put_u8(b'A').put_i64(*mtime);
            }
        }
        b.finish()
    }

    pub fn decode(payload: &[u8]) -> ReplicationResult<Self> {
        let mut r = MessageReader::new(payload);
        let kind = r.get_u8()?;
        let msg = match kind {
            b'r' => StandbyMessage::Reply(StandbyReply {
                receive: LogPosition::new(r.get_u64()?),
                write: LogPosition::new(r.get_u64()?),
                flush: LogPosition::new(r.get_u64()?),
                apply: LogPosition::new(r.get_u64()?),
                peer_role: ServerMode::from_code(r.get_i32()?),
                peer_state: DbState::from_code(r.get_i32()?),
                send_time: r.get_i64()?,
                reply_requested: r.get_bool()?,
            }),
            b'h' => StandbyMessage::HotStandbyFeedback {
                send_time: r.get_i64()?,
                xmin: r.get_u64()?,
            },
            b's' => StandbyMessage::SwitchoverRequest {
                demote_mode: r.get_i32()?,
                send_time: r.get_i64()?,
            },
            b'A' => StandbyMessage::ConfigModifyTime { mtime: r.get_i64()? },
            other => {
                return Err(ReplicationError::protocol_violation(format!(
                    "unexpected standby message type \"{}\"",
                    other as char
                )))
            }
        };
        Ok(msg)
    }
}
