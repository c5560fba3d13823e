//! Sender session: startup, handshake and command execution
//!
//! One session serves one peer connection and is driven by exactly one
//! worker. Everything the session needs from the server comes in through
//! a [`SenderContext`]; everything other sessions may see goes out
//! through its registry slot.
//!
//! ```text
//! startup packet ─► handshake (Q commands) ─► START_REPLICATION ─► stream loop
//!                        │                                            │
//!                        └── X / EOF / timeout ───────────────────────┴─► exit
//! ```

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::capability::{ConsistencyReply, ProtocolCapabilities, CURRENT_PROTOCOL_VERSION};
use super::clock::{Clock, Latch};
use super::command::{ReplicationCommand, SlotSpec, StartMode};
use super::config::SenderConfig;
use super::decoding::{DecoderRegistry, LogicalDecoder};
use super::errors::{ReplicationError, ReplicationErrorKind, ReplicationResult};
use super::log_control::LogControl;
use super::messages::DemoteMode;
use super::protocol::{
    command_complete, copy_both_response, data_row, error_response, ready_for_query,
    row_description, Column, Frame, StartupPacket,
};
use super::registry::{SenderHandle, SenderRegistry};
use super::slots::{SlotKind, SlotManager, SlotPersistency};
use super::state::{DbState, SenderRole, ServerMode, WalSndState};
use super::transport::{Inbound, Transport};
use crate::observability::{log_event_with_fields, Event};
use crate::wal::{consistency_checksum, LogPosition, LogReader};

/// Handshake input poll interval.
pub(super) const HANDSHAKE_POLL: Duration = Duration::from_millis(100);

/// Server-wide resources a session works against.
#[derive(Clone)]
pub struct SenderContext {
    pub config: Arc<SenderConfig>,
    pub log: Arc<dyn LogReader>,
    pub registry: Arc<SenderRegistry>,
    pub slots: Arc<SlotManager>,
    pub decoders: DecoderRegistry,
    pub clock: Arc<dyn Clock>,
}

impl SenderContext {
    pub fn new(
        config: SenderConfig,
        log: Arc<dyn LogReader>,
        slots: Arc<SlotManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(SenderRegistry::new(config.max_senders));
        Self {
            config: Arc::new(config),
            log,
            registry,
            slots,
            decoders: DecoderRegistry::with_builtin(),
            clock,
        }
    }
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Peer sent Terminate.
    Terminated,
    /// Peer ended the copy stream.
    CopyDone,
    /// Server shutdown drained the session.
    Shutdown,
    /// Switchover completed and the promote request was delivered.
    Switchover,
}

impl SessionExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionExit::Terminated => "terminated",
            SessionExit::CopyDone => "copy_done",
            SessionExit::Shutdown => "shutdown",
            SessionExit::Switchover => "switchover",
        }
    }
}

pub(super) enum Handshake {
    Exit(SessionExit),
    Stream,
}

/// Positions most recently confirmed by the peer.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct PeerPositions {
    pub receive: LogPosition,
    pub write: LogPosition,
    pub flush: LogPosition,
    pub apply: LogPosition,
}

/// State of one sender session.
pub struct ReplicationSession<T: Transport> {
    pub(super) ctx: SenderContext,
    pub(super) transport: T,
    pub(super) handle: SenderHandle,
    pub(super) latch: Arc<Latch>,
    pub(super) caps: ProtocolCapabilities,
    pub(super) role: SenderRole,
    pub(super) application_name: String,
    pub(super) database: Option<String>,
    pub(super) state: WalSndState,
    pub(super) sent: LogPosition,
    pub(super) peer: PeerPositions,
    pub(super) log_control: LogControl,
    pub(super) caught_up: bool,
    pub(super) catchup_threshold: u64,
    pub(super) ready_to_stop: bool,
    pub(super) shutdown_requested: bool,
    pub(super) response_switchover_requested: bool,
    pub(super) promote_sent: bool,
    pub(super) demotion: DemoteMode,
    pub(super) waiting_for_ping: bool,
    pub(super) last_reply: i64,
    pub(super) first_keepalive: bool,
    pub(super) remove_log_sent: bool,
    pub(super) end_log_sent: bool,
    pub(super) slot: Option<String>,
    pub(super) decoder: Option<Box<dyn LogicalDecoder>>,
}

impl<T: Transport> ReplicationSession<T> {
    /// Accept a connection whose transport is already built.
    pub fn start(
        ctx: SenderContext,
        startup: &StartupPacket,
        transport: T,
    ) -> ReplicationResult<Self> {
        Self::start_with(ctx, startup, |_| Ok(transport))
    }

    /// Accept a connection, building the transport around the session latch.
    pub fn start_with<F>(
        ctx: SenderContext,
        startup: &StartupPacket,
        make_transport: F,
    ) -> ReplicationResult<Self>
    where
        F: FnOnce(Arc<Latch>) -> ReplicationResult<T>,
    {
        match startup.param("replication").map(|v| v.to_ascii_lowercase()) {
            Some(v) if matches!(v.as_str(), "true" | "on" | "yes" | "1" | "database") => {}
            _ => {
                return Err(ReplicationError::protocol_violation(
                    "replication connection required",
                ))
            }
        }
        let caps = ProtocolCapabilities::from_param(startup.param("replication_protocol"))?;
        let role = SenderRole::from_param(startup.param("sender_role"))?;
        let application_name = startup
            .param("application_name")
            .unwrap_or("walreceiver")
            .to_string();
        let database = startup
            .param("database")
            .map(str::to_string)
            .or_else(|| ctx.config.database.clone());

        let priority = ctx.config.sync_priority(&application_name);
        let handle = match ctx.registry.register(&application_name, role, priority) {
            Ok(h) => h,
            Err(e) => {
                log_event_with_fields(
                    Event::SenderRejected,
                    &[("application_name", &application_name), ("reason", &e.message)],
                );
                return Err(e);
            }
        };
        let latch = handle.latch();
        let transport = make_transport(Arc::clone(&latch))?;

        ctx.registry.metrics().session_started();
        let session_id = handle.session_id().to_string();
        let version = caps.version.to_string();
        log_event_with_fields(
            Event::SenderStart,
            &[
                ("session", &session_id),
                ("application_name", &application_name),
                ("role", role.as_str()),
                ("protocol", &version),
            ],
        );

        let log_control = LogControl::new(ctx.config.target_rto_secs, ctx.config.log_control);
        Ok(Self {
            ctx,
            transport,
            handle,
            latch,
            caps,
            role,
            application_name,
            database,
            state: WalSndState::Startup,
            sent: LogPosition::INVALID,
            peer: PeerPositions::default(),
            log_control,
            caught_up: false,
            catchup_threshold: 0,
            ready_to_stop: false,
            shutdown_requested: false,
            response_switchover_requested: false,
            promote_sent: false,
            demotion: DemoteMode::NoDemote,
            waiting_for_ping: false,
            last_reply: 0,
            first_keepalive: true,
            remove_log_sent: false,
            end_log_sent: false,
            slot: None,
            decoder: None,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.handle.session_id()
    }

    pub fn state(&self) -> WalSndState {
        self.state
    }

    pub fn sent(&self) -> LogPosition {
        self.sent
    }

    pub fn role(&self) -> SenderRole {
        self.role
    }

    pub fn capabilities(&self) -> ProtocolCapabilities {
        self.caps
    }

    pub fn log_control(&self) -> &LogControl {
        &self.log_control
    }

    /// Serve the connection until it ends.
    pub fn run(&mut self) -> ReplicationResult<SessionExit> {
        let result = match self.handshake() {
            Ok(Handshake::Exit(exit)) => Ok(exit),
            Ok(Handshake::Stream) => self.stream(),
            Err(e) => Err(e),
        };
        self.finish(&result);
        result
    }

    fn finish(&mut self, result: &ReplicationResult<SessionExit>) {
        if let Some(name) = self.slot.take() {
            if let Err(e) = self.ctx.slots.release(&name) {
                log_event_with_fields(Event::SenderExit, &[("slot", &name), ("error", &e.message)]);
            }
        }
        let _ = self.transport.flush();

        let metrics = self.ctx.registry.metrics();
        metrics.session_terminated();
        let session_id = self.session_id().to_string();
        let sent = self.sent.to_string();
        match result {
            Ok(exit) => log_event_with_fields(
                Event::SenderExit,
                &[("session", &session_id), ("reason", exit.as_str()), ("sent", &sent)],
            ),
            Err(e) => {
                let event = match e.kind {
                    ReplicationErrorKind::ProtocolViolation => {
                        metrics.protocol_violation();
                        Event::ProtocolViolation
                    }
                    ReplicationErrorKind::Timeout => {
                        metrics.session_timed_out();
                        Event::SenderTimeout
                    }
                    _ => Event::SenderExit,
                };
                log_event_with_fields(
                    event,
                    &[("session", &session_id), ("error", &e.message), ("sent", &sent)],
                );
            }
        }
    }

    pub(super) fn set_state(&mut self, next: WalSndState) -> ReplicationResult<()> {
        self.state = self.state.transition(next)?;
        let state = self.state;
        self.handle.update(|s| s.state = state);
        Ok(())
    }

    pub(super) fn now(&self) -> i64 {
        self.ctx.clock.now_micros()
    }

    pub(super) fn peer_state(&self) -> DbState {
        if self.demotion > DemoteMode::NoDemote {
            DbState::Demoting
        } else {
            DbState::Normal
        }
    }

    pub(super) fn server_mode(&self) -> ServerMode {
        self.ctx.config.server_mode
    }

    /// Read commands until START_REPLICATION or the peer leaves.
    pub(super) fn handshake(&mut self) -> ReplicationResult<Handshake> {
        let timeout = self.ctx.config.sender_timeout * self.role.timeout_factor();
        let mut last_input = self.now();
        loop {
            // nothing is streaming yet, so a last cycle has nothing to drain
            if self.ctx.registry.shutdown_requested()
                || self.ctx.registry.last_cycle_requested()
            {
                return Ok(Handshake::Exit(SessionExit::Shutdown));
            }
            match self.transport.try_recv()? {
                Inbound::Frame(frame) => {
                    last_input = self.now();
                    match frame.tag {
                        b'Q' => {
                            let text = frame.query_text()?;
                            if self.execute_command(&text)? {
                                return Ok(Handshake::Stream);
                            }
                        }
                        b'X' => return Ok(Handshake::Exit(SessionExit::Terminated)),
                        other => {
                            return Err(ReplicationError::protocol_violation(format!(
                                "invalid standby handshake message type {}",
                                other as char
                            )))
                        }
                    }
                }
                Inbound::Eof => {
                    return Err(ReplicationError::peer_closed(
                        "unexpected EOF on standby connection",
                    ))
                }
                Inbound::Empty => {
                    let idle = (self.now() - last_input).max(0) as u128;
                    if self.ctx.config.timeout_enabled() && idle >= timeout.as_micros() {
                        return Err(ReplicationError::timeout(
                            "No message received from standby for maximum time",
                        ));
                    }
                    self.ctx.clock.wait_latch(&self.latch, HANDSHAKE_POLL);
                }
            }
        }
    }

    /// Run one command. Returns true when streaming should begin.
    fn execute_command(&mut self, text: &str) -> ReplicationResult<bool> {
        let session_id = self.session_id().to_string();
        log_event_with_fields(
            Event::HandshakeCommand,
            &[("session", &session_id), ("command", text)],
        );

        let command = ReplicationCommand::parse(text)?;
        let outcome = match command {
            ReplicationCommand::IdentifySystem => self.identify_system().map(|_| false),
            ReplicationCommand::IdentifyVersion => self.identify_version().map(|_| false),
            ReplicationCommand::IdentifyMode => self.identify_mode().map(|_| false),
            ReplicationCommand::IdentifyMaxLsn => self.identify_max_lsn().map(|_| false),
            ReplicationCommand::IdentifyConsistency { position } => {
                self.identify_consistency(position).map(|_| false)
            }
            ReplicationCommand::IdentifyChannel { address } => {
                self.identify_channel(&address).map(|_| false)
            }
            ReplicationCommand::CreateSlot { name, spec } => {
                self.create_slot(&name, spec).map(|_| false)
            }
            ReplicationCommand::DropSlot { name } => self.drop_slot(&name).map(|_| false),
            ReplicationCommand::FetchCheckpoint => self.fetch_checkpoint().map(|_| false),
            ReplicationCommand::StartReplication { slot, start, mode } => match mode {
                StartMode::Physical => self.start_physical(slot, start).map(|_| true),
                StartMode::Logical { options } => {
                    let slot = slot.unwrap_or_default();
                    self.start_logical(&slot, start, &options).map(|_| true)
                }
            },
        };

        match outcome {
            Ok(streaming) => {
                if !streaming {
                    self.transport.send(ready_for_query())?;
                }
                self.transport.flush()?;
                Ok(streaming)
            }
            Err(e) if !e.closes_session() => {
                self.transport.send(error_response(e.sqlstate(), &e.message))?;
                self.transport.send(ready_for_query())?;
                self.transport.flush()?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn send_result(
        &mut self,
        columns: &[Column],
        values: &[Option<String>],
    ) -> ReplicationResult<()> {
        self.transport.send(row_description(columns))?;
        self.transport.send(data_row(values))?;
        self.transport.send(command_complete("SELECT"))
    }

    fn identify_system(&mut self) -> ReplicationResult<()> {
        let values = [
            Some(self.ctx.config.system_id.clone()),
            Some(self.ctx.log.timeline().to_string()),
            Some(self.ctx.log.flushed_position().to_string()),
            self.database.clone(),
        ];
        self.send_result(
            &[
                Column::text("systemid"),
                Column::int4("timeline"),
                Column::text("xlogpos"),
                Column::text("dbname"),
            ],
            &values,
        )
    }

    fn identify_version(&mut self) -> ReplicationResult<()> {
        let values = [
            Some(env!("CARGO_PKG_VERSION").to_string()),
            Some(CURRENT_PROTOCOL_VERSION.to_string()),
            Some(self.ctx.config.term.to_string()),
        ];
        self.send_result(
            &[
                Column::text("sversion"),
                Column::text("pversion"),
                Column::int4("term"),
            ],
            &values,
        )
    }

    fn identify_mode(&mut self) -> ReplicationResult<()> {
        let values = [Some(self.server_mode().code().to_string())];
        self.send_result(&[Column::int4("smode")], &values)
    }

    fn identify_max_lsn(&mut self) -> ReplicationResult<()> {
        let value = format!(
            "{}|{}",
            self.ctx.config.node_name,
            self.ctx.log.flushed_position()
        );
        self.send_result(&[Column::text("recptr")], &[Some(value)])
    }

    fn identify_consistency(&mut self, position: LogPosition) -> ReplicationResult<()> {
        let log = Arc::clone(&self.ctx.log);
        let requested = consistency_checksum(log.as_ref(), position)?;
        match self.caps.consistency_reply {
            ConsistencyReply::Extended => {
                let max = log.flushed_position();
                let max_crc = consistency_checksum(log.as_ref(), max)?;
                let req = match requested {
                    Some(crc) => format!("{:X}", crc),
                    None if self.ctx.registry.standby_caught_up() => "IGNORE_REC_CRC".to_string(),
                    None => "NONE".to_string(),
                };
                let max_crc = max_crc
                    .map(|c| format!("{:X}", c))
                    .unwrap_or_else(|| "NONE".to_string());
                self.send_result(
                    &[
                        Column::text("requestRemoteCrc"),
                        Column::text("localMaxLsn"),
                        Column::text("localMaxLsnCrc"),
                    ],
                    &[Some(req), Some(max.to_string()), Some(max_crc)],
                )
            }
            ConsistencyReply::Legacy => {
                let crc = requested
                    .map(|c| format!("{:X}", c))
                    .unwrap_or_else(|| "NONE".to_string());
                let have = if position <= log.flushed_position() { "1" } else { "0" };
                self.send_result(
                    &[Column::text("reccrc"), Column::int4("havexlog")],
                    &[Some(crc), Some(have.to_string())],
                )
            }
        }
    }

    fn identify_channel(&mut self, address: &str) -> ReplicationResult<()> {
        let known = self
            .ctx
            .config
            .replication_channels
            .iter()
            .any(|c| c == address);
        let value = if known { "t" } else { "f" };
        self.send_result(&[Column::text("identifier")], &[Some(value.to_string())])
    }

    fn fetch_checkpoint(&mut self) -> ReplicationResult<()> {
        let value = self.ctx.log.checkpoint_position().map(|p| p.to_string());
        self.send_result(&[Column::text("checkpoint_lsn")], &[value])
    }

    fn create_slot(&mut self, name: &str, spec: SlotSpec) -> ReplicationResult<()> {
        let slots = Arc::clone(&self.ctx.slots);
        let (consistent_point, snapshot_name, plugin) = match spec {
            SlotSpec::Physical { restart } => {
                let slot = slots.create(
                    name,
                    SlotKind::Physical,
                    SlotPersistency::Persistent,
                    restart.unwrap_or(LogPosition::INVALID),
                )?;
                (slot.restart_lsn, None, None)
            }
            SlotSpec::Logical { plugin } => {
                let mut decoder = self.ctx.decoders.create(&plugin)?;
                let kind = SlotKind::Logical {
                    plugin: plugin.clone(),
                    database: self.database.clone(),
                };
                slots.create(
                    name,
                    kind,
                    SlotPersistency::Ephemeral,
                    self.ctx.log.flushed_position(),
                )?;
                slots.acquire(name)?;
                match self.build_logical_slot(name, decoder.as_mut()) {
                    Ok((point, snapshot)) => {
                        slots.release(name)?;
                        (point, Some(snapshot), Some(plugin))
                    }
                    Err(e) => {
                        // ephemeral, so release drops it
                        let _ = slots.release(name);
                        return Err(e);
                    }
                }
            }
        };
        self.send_result(
            &[
                Column::text("slot_name"),
                Column::text("consistent_point"),
                Column::text("snapshot_name"),
                Column::text("output_plugin"),
            ],
            &[
                Some(name.to_string()),
                Some(consistent_point.to_string()),
                snapshot_name,
                plugin,
            ],
        )
    }

    fn build_logical_slot(
        &mut self,
        name: &str,
        decoder: &mut dyn LogicalDecoder,
    ) -> ReplicationResult<(LogPosition, String)> {
        let point = decoder.build_snapshot(self.ctx.log.as_ref())?;
        let snapshot =
            self.ctx
                .registry
                .export_snapshot(self.session_id(), point.position, point.xmin);
        self.ctx.slots.confirm_logical(name, point.position);
        self.ctx.slots.persist(name)?;
        Ok((point.position, snapshot))
    }

    fn drop_slot(&mut self, name: &str) -> ReplicationResult<()> {
        self.ctx.slots.drop_slot(name)?;
        self.transport.send(command_complete("DROP_REPLICATION_SLOT"))
    }

    fn begin_copy_both(&mut self) -> ReplicationResult<()> {
        self.set_state(WalSndState::Catchup)?;
        self.transport.send(copy_both_response())?;
        Ok(())
    }

    fn start_physical(
        &mut self,
        slot: Option<String>,
        start: LogPosition,
    ) -> ReplicationResult<()> {
        let flushed = self.ctx.log.flushed_position();
        if start > flushed && self.role != SenderRole::DummyStandby {
            return Err(ReplicationError::invalid_request(format!(
                "requested starting point {} is ahead of the WAL flush position of this server {}",
                start, flushed
            )));
        }
        if let Some(name) = slot {
            let acquired = self.ctx.slots.acquire(&name)?;
            if acquired.is_logical() {
                self.ctx.slots.release(&name)?;
                return Err(ReplicationError::invalid_request(
                    "cannot use a logical replication slot for physical replication",
                ));
            }
            self.slot = Some(name);
        }

        self.begin_copy_both()?;
        if self.role == SenderRole::DummyStandby {
            self.choose_dummy_start_point();
        } else {
            self.sent = start;
        }
        self.publish_sent();
        Ok(())
    }

    /// Dummy standbys always receive whole segments: start at the segment
    /// holding the best known position, or the one before it when the
    /// position is exactly on a boundary.
    pub(super) fn choose_dummy_start_point(&mut self) {
        if self.sent.is_valid() {
            return;
        }
        let seg = self.ctx.log.segment_size();
        let best = self
            .ctx
            .slots
            .required_position()
            .unwrap_or_else(|| self.ctx.log.flushed_position());
        let start = if best.is_segment_boundary(seg) {
            LogPosition::new(best.as_u64().saturating_sub(seg))
        } else {
            best.segment_start(seg)
        };
        self.sent = start.max(self.ctx.log.oldest_position());
    }

    fn start_logical(
        &mut self,
        slot: &str,
        start: LogPosition,
        options: &[(String, Option<String>)],
    ) -> ReplicationResult<()> {
        let acquired = self.ctx.slots.acquire(slot)?;
        let plugin = match &acquired.kind {
            SlotKind::Logical { plugin, .. } => plugin.clone(),
            SlotKind::Physical => {
                self.ctx.slots.release(slot)?;
                return Err(ReplicationError::invalid_request(
                    "cannot use a physical replication slot for logical decoding",
                ));
            }
        };
        self.slot = Some(slot.to_string());

        let mut decoder = self.ctx.decoders.create(&plugin)?;
        decoder.startup(options)?;
        self.decoder = Some(decoder);

        self.begin_copy_both()?;
        self.sent = acquired.confirmed_flush.max(start);
        self.publish_sent();
        Ok(())
    }

    pub(super) fn publish_sent(&self) {
        let sent = self.sent;
        let backlog = self.catchup_threshold;
        let caught_up = self.caught_up;
        self.handle.update(|s| {
            s.sent = sent;
            s.catchup_backlog = backlog;
            s.caught_up = caught_up;
        });
    }

    pub(super) fn send_frame(&mut self, frame: Frame) -> ReplicationResult<()> {
        self.transport.send(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::clock::ManualClock;
    use crate::replication::protocol::{parse_data_row, query, terminate};
    use crate::replication::transport::{MemoryTransport, PeerHandle, ScriptStep};
    use crate::wal::MemoryLog;

    fn context(log: Arc<MemoryLog>) -> SenderContext {
        let mut config = SenderConfig::primary();
        config.system_id = "42".into();
        config.node_name = "node1".into();
        config.replication_channels = vec!["10.0.0.7".into()];
        SenderContext::new(
            config,
            log,
            Arc::new(SlotManager::in_memory()),
            Arc::new(ManualClock::default()),
        )
    }

    fn startup() -> StartupPacket {
        StartupPacket::new(196_608).with_param("replication", "true")
    }

    fn run_script(
        ctx: SenderContext,
        steps: Vec<ScriptStep>,
    ) -> (ReplicationResult<SessionExit>, PeerHandle) {
        let (transport, peer) = MemoryTransport::with_script(steps);
        let mut session = ReplicationSession::start(ctx, &startup(), transport).unwrap();
        (session.run(), peer)
    }

    fn rows(frames: &[Frame]) -> Vec<Vec<Option<String>>> {
        frames
            .iter()
            .filter(|f| f.tag == b'D')
            .map(|f| parse_data_row(f).unwrap())
            .collect()
    }

    #[test]
    fn test_requires_replication_param() {
        let log = Arc::new(MemoryLog::new());
        let (transport, _peer) = MemoryTransport::new();
        let err = ReplicationSession::start(context(log), &StartupPacket::new(196_608), transport)
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_identify_system_reports_flush_position() {
        let log = Arc::new(MemoryLog::new());
        let end = log.append_flushed(b"abc");
        let (result, peer) = run_script(
            context(log),
            vec![
                ScriptStep::Frame(query("IDENTIFY_SYSTEM")),
                ScriptStep::Frame(terminate()),
            ],
        );
        assert_eq!(result.unwrap(), SessionExit::Terminated);
        let frames = peer.delivered();
        let row = &rows(&frames)[0];
        assert_eq!(row[0].as_deref(), Some("42"));
        assert_eq!(row[1].as_deref(), Some("1"));
        assert_eq!(row[2], Some(end.to_string()));
        assert_eq!(row[3], None);
        assert_eq!(frames.last().unwrap().tag, b'Z');
    }

    #[test]
    fn test_identify_max_lsn_and_channel() {
        let log = Arc::new(MemoryLog::new());
        let end = log.append_flushed(b"abc");
        let (_, peer) = run_script(
            context(log),
            vec![
                ScriptStep::Frame(query("IDENTIFY_MAXLSN")),
                ScriptStep::Frame(query("IDENTIFY_CHANNEL 10.0.0.7")),
                ScriptStep::Frame(query("IDENTIFY_CHANNEL 10.0.0.8")),
                ScriptStep::Frame(terminate()),
            ],
        );
        let rows = rows(&peer.delivered());
        assert_eq!(rows[0][0], Some(format!("node1|{}", end)));
        assert_eq!(rows[1][0].as_deref(), Some("t"));
        assert_eq!(rows[2][0].as_deref(), Some("f"));
    }

    #[test]
    fn test_consistency_reports_none_past_end() {
        let log = Arc::new(MemoryLog::new());
        log.append_flushed(&[9u8; 64]);
        let (_, peer) = run_script(
            context(log),
            vec![
                ScriptStep::Frame(query("IDENTIFY_CONSISTENCY FF/0")),
                ScriptStep::Frame(terminate()),
            ],
        );
        let row = &rows(&peer.delivered())[0];
        assert_eq!(row[0].as_deref(), Some("NONE"));
        assert_ne!(row[2].as_deref(), Some("NONE"));
    }

    #[test]
    fn test_slot_errors_keep_connection() {
        let log = Arc::new(MemoryLog::new());
        let (result, peer) = run_script(
            context(log),
            vec![
                ScriptStep::Frame(query("DROP_REPLICATION_SLOT missing")),
                ScriptStep::Frame(query("IDENTIFY_MODE")),
                ScriptStep::Frame(terminate()),
            ],
        );
        assert_eq!(result.unwrap(), SessionExit::Terminated);
        let tags: Vec<u8> = peer.delivered().iter().map(|f| f.tag).collect();
        assert_eq!(tags, vec![b'E', b'Z', b'T', b'D', b'C', b'Z']);
    }

    #[test]
    fn test_unknown_command_is_fatal() {
        let log = Arc::new(MemoryLog::new());
        let (result, _) = run_script(
            context(log),
            vec![ScriptStep::Frame(query("BASE_BACKUP"))],
        );
        let err = result.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.message.starts_with("syntax error in replication command"));
    }

    #[test]
    fn test_dummy_start_point_rules() {
        let log = Arc::new(MemoryLog::with_segment_size(8192));
        log.append_flushed(&[0u8; 8192 + 100]);
        let ctx = context(log.clone());
        let (transport, _peer) = MemoryTransport::new();
        let startup = startup().with_param("sender_role", "dummystandby");
        let mut session = ReplicationSession::start(ctx, &startup, transport).unwrap();
        session.choose_dummy_start_point();
        // flushed is mid segment 2, start at its beginning
        assert_eq!(session.sent(), LogPosition::new(2 * 8192));

        let log = Arc::new(MemoryLog::with_segment_size(8192));
        log.append_flushed(&[0u8; 2 * 8192]);
        let (transport, _peer) = MemoryTransport::new();
        let mut session = ReplicationSession::start(context(log), &startup, transport).unwrap();
        session.choose_dummy_start_point();
        // flushed exactly at the start of segment 3, step back one segment
        assert_eq!(session.sent(), LogPosition::new(2 * 8192));
    }
}
