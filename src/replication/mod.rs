//! Replication sender
//!
//! Serves standbys and logical consumers from the durable log.
//!
//! # Session lifecycle
//!
//! ```text
//! Startup ──► Catchup ──► Streaming
//!    │           │            │
//!    └───────────┴────────────┴──► exit (terminate, copy done, timeout,
//!                                        shutdown, switchover)
//! ```
//!
//! - A session never sends log past the flush position
//! - Replies that move a standby position backward are ignored
//! - Only one switchover may be pending across all sessions
//! - Log control pacing only applies while streaming
//!
//! Sessions are synchronous and transport-agnostic. [`ReplicationServer`]
//! puts them behind a tokio listener; tests drive them through
//! [`MemoryTransport`] with a [`ManualClock`].

mod capability;
mod clock;
mod command;
mod config;
mod decoding;
mod errors;
mod log_control;
mod messages;
mod protocol;
mod registry;
mod reply;
mod server;
mod session;
mod slots;
mod state;
mod stream;
mod switchover;
mod transport;

pub use capability::{
    ConsistencyReply, ProtocolCapabilities, CURRENT_PROTOCOL_VERSION, EXTENDED_CONSISTENCY_SINCE,
    MIN_PROTOCOL_VERSION,
};
pub use clock::{Clock, Latch, ManualClock, SystemClock};
pub use command::{ReplicationCommand, SlotSpec, StartMode};
pub use config::{LogControlTuning, SenderConfig, DEFAULT_MAX_SEND_SIZE};
pub use decoding::{ConsistentPoint, DecodedChange, DecoderRegistry, LogicalDecoder, RawDecoder};
pub use errors::{ReplicationError, ReplicationErrorKind, ReplicationResult};
pub use log_control::{LogControl, LogControlStats, PacingTransition};
pub use messages::{
    DemoteMode, SenderMessage, StandbyMessage, StandbyReply, SwitchoverResponseKind,
    WalDataHeader, SYNC_DUMMY_STANDBY_END,
};
pub use protocol::{
    command_complete, copy_both_response, copy_data, copy_done, data_row, error_response,
    parse_data_row, parse_row_description, query, read_frame, ready_for_query, row_description,
    terminate, Column, Frame, StartupPacket,
};
pub use registry::{
    DemotionDecision, ExportedSnapshot, SenderHandle, SenderRegistry, SenderRow, SenderStatus,
    SyncRepWaiters, SyncState,
};
pub use server::ReplicationServer;
pub use session::{ReplicationSession, SenderContext, SessionExit};
pub use slots::{
    validate_slot_name, ReplicationSlot, SlotKind, SlotManager, SlotPersistency,
    MAX_SLOT_NAME_LEN,
};
pub use state::{DbState, SenderRole, ServerMode, WalSndState};
pub use transport::{Inbound, MemoryTransport, PeerHandle, ScriptStep, TcpTransport, Transport};
