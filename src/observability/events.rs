//! Observable events
//!
//! Every log line the sender or the call stack emits names one of these.
//! Events are explicit and typed; free-form detail goes into fields.

use std::fmt;

use super::logger::Severity;

/// Observable events in aerorepl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Server lifecycle
    /// Listener bound and accepting
    ServerListening,
    /// Listener stopped
    ServerShutdown,
    /// Configuration loaded and validated
    ConfigLoaded,

    // Session lifecycle
    /// A sender session was registered
    SenderStart,
    /// A sender session ended
    SenderExit,
    /// Registry full, connection refused
    SenderRejected,
    /// Replication command received during the handshake
    HandshakeCommand,
    /// Malformed or unexpected peer input
    ProtocolViolation,
    /// START_REPLICATION accepted
    StreamingBegin,
    /// Catchup drained, session now streaming
    CatchupComplete,
    /// No reply within the sender timeout
    SenderTimeout,
    /// Peer confirmation regressed and was ignored
    ReplyIgnored,
    /// Requested log already recycled
    SegmentRemoved,

    // Pacing
    /// Adaptive sleep went from zero to positive
    LogControlEngaged,
    /// Adaptive sleep returned to zero
    LogControlReleased,

    // Switchover
    /// Standby asked for a switchover
    SwitchoverRequested,
    /// Switchover refused or ignored
    SwitchoverRejected,
    /// Switchover response sent to the standby
    SwitchoverResponse,

    // Slots
    /// Replication slot created
    SlotCreated,
    /// Replication slot dropped
    SlotDropped,

    /// Configuration file pushed to the standby
    ConfigPushed,

    // Call stack
    /// Frames left behind at transaction end
    SpiStackLeak,
    /// Call-stack invariant violated
    SpiDataCorrupted,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ServerListening => "SERVER_LISTENING",
            Event::ServerShutdown => "SERVER_SHUTDOWN",
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::SenderStart => "SENDER_START",
            Event::SenderExit => "SENDER_EXIT",
            Event::SenderRejected => "SENDER_REJECTED",
            Event::HandshakeCommand => "HANDSHAKE_COMMAND",
            Event::ProtocolViolation => "PROTOCOL_VIOLATION",
            Event::StreamingBegin => "STREAMING_BEGIN",
            Event::CatchupComplete => "CATCHUP_COMPLETE",
            Event::SenderTimeout => "SENDER_TIMEOUT",
            Event::ReplyIgnored => "REPLY_IGNORED",
            Event::SegmentRemoved => "WAL_SEGMENT_REMOVED",

            Event::LogControlEngaged => "LOG_CONTROL_ENGAGED",
            Event::LogControlReleased => "LOG_CONTROL_RELEASED",

            Event::SwitchoverRequested => "SWITCHOVER_REQUESTED",
            Event::SwitchoverRejected => "SWITCHOVER_REJECTED",
            Event::SwitchoverResponse => "SWITCHOVER_RESPONSE",

            Event::SlotCreated => "SLOT_CREATED",
            Event::SlotDropped => "SLOT_DROPPED",

            Event::ConfigPushed => "CONFIG_PUSHED",

            Event::SpiStackLeak => "SPI_STACK_LEAK",
            Event::SpiDataCorrupted => "SPI_DATA_CORRUPTED",
        }
    }

    /// Severity the event is logged at.
    pub fn severity(&self) -> Severity {
        match self {
            Event::SpiDataCorrupted => Severity::Fatal,
            Event::ProtocolViolation | Event::SegmentRemoved | Event::SenderRejected => {
                Severity::Error
            }
            Event::SenderTimeout
            | Event::ReplyIgnored
            | Event::SwitchoverRejected
            | Event::SpiStackLeak => Severity::Warn,
            _ => Severity::Info,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
