//! Streaming phase of a sender session
//!
//! After START_REPLICATION the session alternates between draining peer
//! replies, sending the next batch of log, and sleeping on its latch until
//! either new input arrives or a deadline passes.
//!
//! # Invariants
//!
//! - `sent` never moves backward
//! - Log is only sent once it is durable
//! - Physical batches end on a page boundary unless they reach the flush
//!   position
//! - State moves Catchup -> Streaming once and never back

use std::sync::Arc;
use std::time::Duration;

use super::errors::{ReplicationError, ReplicationErrorKind, ReplicationResult};
use super::messages::{
    DemoteMode, SenderMessage, SwitchoverResponseKind, WalDataHeader, SYNC_DUMMY_STANDBY_END,
};
use super::protocol::{command_complete, copy_data, copy_done};
use super::session::{ReplicationSession, SessionExit};
use super::state::{SenderRole, WalSndState};
use super::transport::Transport;
use crate::observability::{log_event_with_fields, Event};
use crate::wal::{LogPosition, WalErrorCode, PAGE_SIZE};

/// Sleep when nothing else bounds the wait.
const IDLE_SLEEP: Duration = Duration::from_secs(1);

/// Sleep while a switchover answer or shutdown drain is pending.
const DRAIN_SLEEP: Duration = Duration::from_millis(100);

impl<T: Transport> ReplicationSession<T> {
    /// Main loop. Returns once the peer leaves or the session drains.
    pub(super) fn stream(&mut self) -> ReplicationResult<SessionExit> {
        self.transport.flush()?;
        self.last_reply = self.now();
        let session_id = self.session_id().to_string();
        let start = self.sent.to_string();
        log_event_with_fields(
            Event::StreamingBegin,
            &[
                ("session", &session_id),
                ("start", &start),
                ("role", self.role.as_str()),
            ],
        );

        loop {
            self.latch.reset();

            if self.ctx.registry.catchup_online()
                && self.ctx.registry.demotion() > DemoteMode::NoDemote
            {
                self.send_switchover_response(SwitchoverResponseKind::DemoteCatchupExist)?;
                self.transport.flush()?;
                self.ctx.registry.reset_demotion();
                return Err(ReplicationError::switchover(
                    "catchup is online, switchover aborted",
                ));
            }

            if self.ctx.registry.shutdown_requested() {
                // unsent log stays unsent
                self.send_stream_done();
                return Ok(SessionExit::Shutdown);
            }
            if !self.ready_to_stop && self.ctx.registry.last_cycle_requested() {
                self.ready_to_stop = true;
            }
            if self.shutdown_requested && !self.response_switchover_requested {
                self.send_stream_done();
                return Ok(if self.promote_sent {
                    SessionExit::Switchover
                } else {
                    SessionExit::Shutdown
                });
            }

            if let Some(exit) = self.process_replies()? {
                return Ok(exit);
            }

            if self.first_keepalive {
                self.send_keepalive(false)?;
                self.first_keepalive = false;
            }

            if !self.ready_to_stop && self.handle.take_promotion_approval() {
                self.ready_to_stop = true;
                self.response_switchover_requested = true;
            }

            if self.response_switchover_requested
                && self.peer.flush >= self.ctx.log.flushed_position()
                && !self.transport.has_pending()
            {
                self.send_switchover_response(SwitchoverResponseKind::PromoteRequest)?;
                self.response_switchover_requested = false;
                self.promote_sent = true;
            }

            if !self.transport.has_pending() {
                self.send_next()?;
            } else {
                self.caught_up = false;
            }

            // a failed flush means the peer is gone
            self.transport.flush()?;

            if self.caught_up && !self.transport.has_pending() {
                if self.state == WalSndState::Catchup {
                    self.set_state(WalSndState::Streaming)?;
                    let sent = self.sent.to_string();
                    log_event_with_fields(
                        Event::CatchupComplete,
                        &[("session", &session_id), ("sent", &sent)],
                    );
                    self.send_keepalive(true)?;
                }
                self.catchup_threshold = 0;
                self.publish_sent();

                if self.ready_to_stop {
                    let blocked = self.role == SenderRole::DummyStandby
                        && self.ctx.registry.standby_streaming(self.session_id());
                    if !blocked {
                        self.send_next()?;
                    }
                    if self.sent == self.peer.flush {
                        self.shutdown_requested = true;
                    }
                }
            } else if self.state == WalSndState::Streaming
                && self.catchup_threshold >= self.ctx.config.effective_send_size()
            {
                self.publish_sent();
            }

            if self.caught_up || self.transport.has_pending() {
                let timeout = self.sleep_timeout();
                if !timeout.is_zero() {
                    self.ctx.clock.wait_latch(&self.latch, timeout);
                }
            }
        }
    }

    /// How long to wait for input before the next pass.
    pub(super) fn sleep_timeout(&self) -> Duration {
        let sender_timeout = self.ctx.config.sender_timeout;
        let mut sleep = IDLE_SLEEP;
        if self.ctx.config.timeout_enabled() && self.last_reply > 0 {
            let window = if self.waiting_for_ping {
                sender_timeout
            } else {
                sender_timeout / 2
            };
            let wake = self.last_reply + window.as_micros() as i64;
            let now = self.now();
            sleep = if wake > now {
                Duration::from_micros((wake - now) as u64)
            } else {
                Duration::ZERO
            };
        }
        if self.response_switchover_requested
            || self.ready_to_stop
            || self.ctx.registry.shutdown_requested()
        {
            sleep = sleep.min(DRAIN_SLEEP);
        }
        if self.ctx.config.timeout_enabled() {
            sleep = sleep.min(sender_timeout / 2);
        }
        sleep
    }

    /// Tell the peer streaming is over. The session is ending either way.
    fn send_stream_done(&mut self) {
        let _ = self.transport.send(copy_done());
        let _ = self.transport.send(command_complete("COPY 0"));
        let _ = self.transport.flush();
    }

    /// One send step, with dummy standby rules applied.
    fn send_next(&mut self) -> ReplicationResult<()> {
        match self.role {
            SenderRole::DummyStandby => {
                if self.ctx.registry.standby_streaming(self.session_id()) {
                    // a real standby covers the log, the dummy idles
                    self.caught_up = true;
                    if !self.remove_log_sent {
                        self.send_remove_log()?;
                        self.remove_log_sent = true;
                    }
                    return Ok(());
                }
                self.remove_log_sent = false;
                self.send_data()?;
                if self.caught_up {
                    self.send_end_log_once()?;
                }
                Ok(())
            }
            SenderRole::DummyToStandby => {
                self.send_data()?;
                if self.caught_up {
                    self.send_end_log_once()?;
                }
                Ok(())
            }
            SenderRole::Standby | SenderRole::BuildStandby => self.send_data(),
        }
    }

    fn send_end_log_once(&mut self) -> ReplicationResult<()> {
        if self.end_log_sent {
            return Ok(());
        }
        let message = SenderMessage::EndLog {
            peer_role: self.server_mode(),
            peer_state: self.peer_state(),
            send_time: self.now(),
            percent: SYNC_DUMMY_STANDBY_END,
        };
        self.transport.send(copy_data(message.encode()))?;
        self.end_log_sent = true;
        Ok(())
    }

    fn send_remove_log(&mut self) -> ReplicationResult<()> {
        let message = SenderMessage::RemoveLog {
            peer_role: self.server_mode(),
            peer_state: self.peer_state(),
            send_time: self.now(),
            reply_requested: false,
        };
        self.transport.send(copy_data(message.encode()))
    }

    /// Send the next batch of durable log, if any.
    pub(super) fn send_data(&mut self) -> ReplicationResult<()> {
        if !self.ctx.config.stream_replication_enabled {
            self.caught_up = true;
            return Ok(());
        }
        if self.decoder.is_some() {
            return self.send_decoded();
        }

        let flushed = self.ctx.log.flushed_position();
        if flushed <= self.sent {
            self.caught_up = true;
            return Ok(());
        }

        let start = self.sent;
        let mut end = start.advance(self.ctx.config.effective_send_size());
        if end >= flushed {
            end = flushed;
            self.caught_up = true;
            self.catchup_threshold = 0;
        } else {
            end = end.page_floor(PAGE_SIZE);
            if end <= start {
                end = flushed.min(start.advance(PAGE_SIZE));
            }
            self.caught_up = false;
            self.catchup_threshold = flushed.distance_from(end);
        }

        let data = match self.ctx.log.read(start, end.distance_from(start)) {
            Ok(data) => data,
            Err(e) if e.code() == WalErrorCode::AeroWalSegmentRemoved => {
                let session_id = self.session_id().to_string();
                let segment = self.ctx.log.segment_name(start);
                log_event_with_fields(
                    Event::SegmentRemoved,
                    &[("session", &session_id), ("segment", &segment)],
                );
                return Err(ReplicationError::new(
                    ReplicationErrorKind::MissingSegment,
                    format!("requested WAL segment {} has already been removed", segment),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        self.send_wal_data(start, flushed, data)?;
        self.sent = end;
        self.end_log_sent = false;
        self.publish_sent();
        Ok(())
    }

    fn send_decoded(&mut self) -> ReplicationResult<()> {
        let flushed = self.ctx.log.flushed_position();
        if flushed <= self.sent {
            self.caught_up = true;
            return Ok(());
        }
        let max = self.ctx.config.effective_send_size();
        let log = Arc::clone(&self.ctx.log);
        let changes = match self.decoder.as_mut() {
            Some(decoder) => decoder.decode(log.as_ref(), self.sent, flushed, max)?,
            None => return Ok(()),
        };

        let mut end = self.sent;
        for change in changes {
            end = end.max(change.end);
            self.send_wal_data(change.start, flushed, change.data)?;
        }
        if end <= self.sent {
            self.caught_up = true;
            return Ok(());
        }
        self.sent = end;
        self.caught_up = end >= flushed;
        self.catchup_threshold = flushed.distance_from(end);
        self.publish_sent();
        Ok(())
    }

    fn send_wal_data(
        &mut self,
        data_start: LogPosition,
        wal_end: LogPosition,
        data: Vec<u8>,
    ) -> ReplicationResult<()> {
        let bytes = data.len() as u64;
        let message = SenderMessage::WalData {
            header: WalDataHeader {
                data_start,
                wal_end,
                send_time: self.now(),
                sender_sent: self.sent,
                sender_write: wal_end,
                sender_flush: wal_end,
                sender_replay: wal_end,
                catchup: self.state == WalSndState::Catchup,
            },
            data,
        };
        self.transport.send(copy_data(message.encode()))?;
        self.ctx.registry.metrics().data_sent(bytes);
        Ok(())
    }

    /// Send a keepalive carrying the current send position.
    pub(super) fn send_keepalive(&mut self, reply_requested: bool) -> ReplicationResult<()> {
        let message = SenderMessage::Keepalive {
            peer_role: self.server_mode(),
            peer_state: self.peer_state(),
            wal_end: self.sent,
            send_time: self.now(),
            reply_requested,
            catchup: self.state == WalSndState::Catchup,
        };
        self.transport.send(copy_data(message.encode()))?;
        self.ctx.registry.metrics().keepalive_sent();
        Ok(())
    }

    pub(super) fn send_switchover_response(
        &mut self,
        response: SwitchoverResponseKind,
    ) -> ReplicationResult<()> {
        let message = SenderMessage::SwitchoverResponse {
            response,
            wal_end: self.sent,
            send_time: self.now(),
        };
        self.transport.send(copy_data(message.encode()))?;
        let session_id = self.session_id().to_string();
        log_event_with_fields(
            Event::SwitchoverResponse,
            &[("session", &session_id), ("response", response.as_str())],
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::replication::clock::ManualClock;
    use crate::replication::config::SenderConfig;
    use crate::replication::messages::StandbyMessage;
    use crate::replication::protocol::{query, StartupPacket};
    use crate::replication::session::{Handshake, SenderContext};
    use crate::replication::slots::SlotManager;
    use crate::replication::transport::{MemoryTransport, PeerHandle, ScriptStep};
    use crate::wal::{LogReader, MemoryLog};

    fn session(
        log: Arc<MemoryLog>,
        config: SenderConfig,
        steps: Vec<ScriptStep>,
    ) -> (ReplicationSession<MemoryTransport>, PeerHandle) {
        let ctx = SenderContext::new(
            config,
            log,
            Arc::new(SlotManager::in_memory()),
            Arc::new(ManualClock::default()),
        );
        let (transport, peer) = MemoryTransport::with_script(steps);
        let startup = StartupPacket::new(196_608).with_param("replication", "true");
        (ReplicationSession::start(ctx, &startup, transport).unwrap(), peer)
    }

    fn wal_batches(peer: &PeerHandle) -> Vec<(LogPosition, usize)> {
        peer.delivered()
            .iter()
            .filter_map(|f| f.copy_payload())
            .filter_map(|p| SenderMessage::decode(p).ok())
            .filter_map(|m| match m {
                SenderMessage::WalData { header, data } => Some((header.data_start, data.len())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_batches_end_on_page_boundary() {
        let log = Arc::new(MemoryLog::new());
        let start = log.flushed_position();
        log.append_flushed(&vec![5u8; 3 * 8192 + 100]);
        let mut config = SenderConfig::primary();
        config.max_send_size = 8192 + 500;
        let (mut s, peer) = session(log, config, vec![]);
        s.sent = start;
        s.state = WalSndState::Catchup;

        s.send_data().unwrap();
        assert_eq!(s.sent(), start.advance(8192));
        assert!(!s.caught_up);
        s.transport.flush().unwrap();
        assert_eq!(wal_batches(&peer), vec![(start, 8192)]);
    }

    #[test]
    fn test_final_batch_reaches_flush_and_catches_up() {
        let log = Arc::new(MemoryLog::new());
        let start = log.flushed_position();
        let end = log.append_flushed(&[1u8; 300]);
        let (mut s, _peer) = session(log, SenderConfig::primary(), vec![]);
        s.sent = start;
        s.send_data().unwrap();
        assert_eq!(s.sent(), end);
        assert!(s.caught_up);
        assert_eq!(s.catchup_threshold, 0);
    }

    #[test]
    fn test_disabled_streaming_sends_nothing() {
        let log = Arc::new(MemoryLog::new());
        let start = log.flushed_position();
        log.append_flushed(&[1u8; 300]);
        let mut config = SenderConfig::primary();
        config.stream_replication_enabled = false;
        let (mut s, peer) = session(log, config, vec![]);
        s.sent = start;
        s.send_data().unwrap();
        assert!(s.caught_up);
        assert_eq!(s.sent(), start);
        s.transport.flush().unwrap();
        assert!(wal_batches(&peer).is_empty());
    }

    #[test]
    fn test_removed_segment_ends_session() {
        let log = Arc::new(MemoryLog::with_segment_size(8192));
        let start = log.flushed_position();
        log.append_flushed(&[1u8; 3 * 8192]);
        log.recycle_before(LogPosition::new(3 * 8192));
        let (mut s, _peer) = session(log, SenderConfig::primary(), vec![]);
        s.sent = start;
        let err = s.send_data().unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::MissingSegment);
        assert!(err.message.contains("has already been removed"));
    }

    #[test]
    fn test_sleep_timeout_bounded_by_half_timeout() {
        let log = Arc::new(MemoryLog::new());
        let (mut s, _peer) = session(log, SenderConfig::primary(), vec![]);
        s.last_reply = s.now();
        assert_eq!(s.sleep_timeout(), Duration::from_secs(3));

        s.waiting_for_ping = true;
        assert_eq!(s.sleep_timeout(), Duration::from_secs(3));

        s.response_switchover_requested = true;
        assert_eq!(s.sleep_timeout(), DRAIN_SLEEP);
    }

    #[test]
    fn test_sleep_timeout_zero_once_deadline_passed() {
        let log = Arc::new(MemoryLog::new());
        let (mut s, _peer) = session(log, SenderConfig::primary(), vec![]);
        s.last_reply = s.now() - 10_000_000;
        assert_eq!(s.sleep_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_streaming_terminates_on_copy_done() {
        let log = Arc::new(MemoryLog::new());
        let start = log.flushed_position();
        log.append_flushed(&[3u8; 1000]);
        let reply = StandbyMessage::Reply(crate::replication::messages::StandbyReply {
            receive: start.advance(1000),
            write: start.advance(1000),
            flush: start.advance(1000),
            apply: start.advance(1000),
            peer_role: crate::replication::state::ServerMode::Standby,
            peer_state: crate::replication::state::DbState::Normal,
            send_time: 0,
            reply_requested: false,
        });
        let (mut s, peer) = session(
            log,
            SenderConfig::primary(),
            vec![
                ScriptStep::Frame(query(&format!("START_REPLICATION {}", start))),
                ScriptStep::Idle(2),
                ScriptStep::Frame(copy_data(reply.encode())),
                ScriptStep::Idle(1),
                ScriptStep::Frame(copy_done()),
            ],
        );
        assert_eq!(s.run().unwrap(), SessionExit::CopyDone);
        assert_eq!(s.state(), WalSndState::Streaming);
        assert_eq!(wal_batches(&peer), vec![(start, 1000)]);
    }

    #[test]
    fn test_last_cycle_drains_before_stopping() {
        let log = Arc::new(MemoryLog::new());
        let start = log.flushed_position();
        let end = log.append_flushed(&vec![4u8; 4 * 8192]);
        let reply = StandbyMessage::Reply(crate::replication::messages::StandbyReply {
            receive: end,
            write: end,
            flush: end,
            apply: end,
            peer_role: crate::replication::state::ServerMode::Standby,
            peer_state: crate::replication::state::DbState::Normal,
            send_time: 0,
            reply_requested: false,
        });
        let mut config = SenderConfig::primary();
        config.max_send_size = 8192;
        config.sender_timeout = Duration::ZERO;
        let (mut s, peer) = session(
            log,
            config,
            vec![
                ScriptStep::Frame(query(&format!("START_REPLICATION {}", start))),
                ScriptStep::Idle(6),
                ScriptStep::Frame(copy_data(reply.encode())),
            ],
        );
        assert!(matches!(s.handshake().unwrap(), Handshake::Stream));
        s.ctx.registry.request_last_cycle();

        assert_eq!(s.stream().unwrap(), SessionExit::Shutdown);
        assert_eq!(s.sent(), end);
        let batches = wal_batches(&peer);
        assert_eq!(batches.len(), 4);
        assert_eq!(batches.iter().map(|(_, n)| n).sum::<usize>(), 4 * 8192);

        let tail: Vec<u8> = peer.delivered().iter().rev().take(2).map(|f| f.tag).collect();
        assert_eq!(tail, vec![b'C', b'c']);
    }

    #[test]
    fn test_immediate_shutdown_skips_unsent_log() {
        let log = Arc::new(MemoryLog::new());
        let start = log.flushed_position();
        log.append_flushed(&[4u8; 8192]);
        let (mut s, peer) = session(
            log,
            SenderConfig::primary(),
            vec![ScriptStep::Frame(query(&format!("START_REPLICATION {}", start)))],
        );
        assert!(matches!(s.handshake().unwrap(), Handshake::Stream));
        s.ctx.registry.request_shutdown();

        assert_eq!(s.stream().unwrap(), SessionExit::Shutdown);
        assert_eq!(s.sent(), start);
        assert!(wal_batches(&peer).is_empty());
    }
}
