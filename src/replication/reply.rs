//! Inbound traffic during streaming
//!
//! Drains every frame the peer has sent, applies standby messages to the
//! session and the shared registry, and enforces the reply timeout when
//! nothing arrived.

use chrono::{DateTime, Utc};

use super::errors::{ReplicationError, ReplicationResult};
use super::messages::{SenderMessage, StandbyMessage, StandbyReply};
use super::protocol::copy_data;
use super::session::{ReplicationSession, SessionExit};
use super::state::WalSndState;
use super::transport::{Inbound, Transport};
use crate::observability::{log_event_with_fields, Event};

impl<T: Transport> ReplicationSession<T> {
    /// Read everything the peer sent. Returns an exit when the peer ended
    /// the stream.
    pub(super) fn process_replies(&mut self) -> ReplicationResult<Option<SessionExit>> {
        let mut received = false;
        loop {
            match self.transport.try_recv()? {
                Inbound::Frame(frame) => match frame.tag {
                    b'd' => {
                        let payload = frame.copy_payload().unwrap_or_default().to_vec();
                        self.handle_standby_message(&payload)?;
                        received = true;
                    }
                    b'c' => return Ok(Some(SessionExit::CopyDone)),
                    b'X' => return Ok(Some(SessionExit::Terminated)),
                    other => {
                        return Err(ReplicationError::protocol_violation(format!(
                            "invalid standby message type \"{}\"",
                            other as char
                        )))
                    }
                },
                Inbound::Eof => {
                    return Err(ReplicationError::peer_closed(
                        "unexpected EOF on standby connection",
                    ))
                }
                Inbound::Empty => break,
            }
        }

        if received {
            self.last_reply = self.now();
            self.waiting_for_ping = false;
        } else {
            self.check_timeout()?;
            self.keepalive_if_necessary()?;
        }
        Ok(None)
    }

    fn handle_standby_message(&mut self, payload: &[u8]) -> ReplicationResult<()> {
        match StandbyMessage::decode(payload)? {
            StandbyMessage::Reply(reply) => self.process_reply(reply),
            StandbyMessage::HotStandbyFeedback { xmin, .. } => {
                self.process_feedback(xmin);
                Ok(())
            }
            StandbyMessage::SwitchoverRequest { demote_mode, .. } => {
                self.process_switchover_request(demote_mode)
            }
            StandbyMessage::ConfigModifyTime { mtime } => self.process_config_mtime(mtime),
        }
    }

    fn process_reply(&mut self, reply: StandbyReply) -> ReplicationResult<()> {
        let regressed = reply.write < self.peer.write
            || reply.flush < self.peer.flush
            || reply.apply < self.peer.apply;
        if regressed {
            self.ctx.registry.metrics().reply_ignored();
            let session_id = self.session_id().to_string();
            let got = format!("{}/{}/{}", reply.write, reply.flush, reply.apply);
            let had = format!("{}/{}/{}", self.peer.write, self.peer.flush, self.peer.apply);
            log_event_with_fields(
                Event::ReplyIgnored,
                &[("session", &session_id), ("reply", &got), ("known", &had)],
            );
            return Ok(());
        }

        if reply.reply_requested {
            self.send_keepalive(false)?;
        }

        self.peer.receive = reply.receive;
        self.peer.write = reply.write;
        self.peer.flush = reply.flush;
        self.peer.apply = reply.apply;

        let streaming = self.state == WalSndState::Streaming;
        let pause = self.log_control.on_reply(&reply, streaming);
        let stats = self.log_control.stats();
        let now = self.now();
        self.handle.update(|s| {
            s.receive = reply.receive;
            s.write = reply.write;
            s.flush = reply.flush;
            s.apply = reply.apply;
            s.peer_role = reply.peer_role;
            s.peer_state = reply.peer_state;
            s.last_reply_time = now;
            s.log_control = stats;
        });
        if !pause.is_zero() {
            self.ctx.clock.sleep(pause);
        }

        self.ctx.registry.release_sync_waiters();

        if reply.flush.is_valid() {
            if let Some(name) = self.slot.clone() {
                if self.decoder.is_some() {
                    self.ctx.slots.confirm_logical(&name, reply.flush);
                } else {
                    let seg = self.ctx.log.segment_size();
                    self.ctx.slots.confirm_physical(&name, reply.flush, seg);
                }
            }
        }
        self.ctx.registry.metrics().reply_processed();
        Ok(())
    }

    fn process_feedback(&mut self, xmin: u64) {
        if xmin == 0 {
            return;
        }
        self.handle.update(|s| s.xmin = xmin);
        if let Some(name) = &self.slot {
            self.ctx.slots.advance_xmin(name, xmin);
        }
    }

    /// Push the configuration file when the peer's copy is stale.
    fn process_config_mtime(&mut self, peer_mtime: i64) -> ReplicationResult<()> {
        let Some(path) = self.ctx.config.config_file.clone() else {
            return Ok(());
        };
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|e| ReplicationError::io("could not stat configuration file", &e))?;
        let local_mtime = DateTime::<Utc>::from(modified).timestamp();
        if local_mtime == peer_mtime {
            return Ok(());
        }
        let contents = std::fs::read(&path)
            .map_err(|e| ReplicationError::io("could not read configuration file", &e))?;
        let bytes = contents.len().to_string();
        self.transport
            .send(copy_data(SenderMessage::ConfigPush { contents }.encode()))?;
        let session_id = self.session_id().to_string();
        log_event_with_fields(
            Event::ConfigPushed,
            &[("session", &session_id), ("bytes", &bytes)],
        );
        Ok(())
    }

    /// Fail the session when the peer has been silent too long.
    fn check_timeout(&self) -> ReplicationResult<()> {
        if !self.ctx.config.timeout_enabled() || self.last_reply <= 0 {
            return Ok(());
        }
        let timeout = self.ctx.config.sender_timeout * self.role.timeout_factor();
        let last = self.last_reply.max(self.ctx.registry.last_heartbeat());
        if self.now() >= last + timeout.as_micros() as i64 {
            return Err(ReplicationError::timeout(
                "terminating sender due to replication timeout",
            ));
        }
        Ok(())
    }

    /// Ask for a reply once half the timeout has passed in silence.
    fn keepalive_if_necessary(&mut self) -> ReplicationResult<()> {
        if !self.ctx.config.timeout_enabled() || self.waiting_for_ping || self.last_reply <= 0 {
            return Ok(());
        }
        let half = (self.ctx.config.sender_timeout / 2).as_micros() as i64;
        if self.now() >= self.last_reply + half {
            self.send_keepalive(true)?;
            self.transport.flush()?;
            self.waiting_for_ping = true;
        }
        Ok(())
    }
}
