//! Switchover requests from a standby
//!
//! A standby asks the primary to demote. The request is recorded in the
//! registry, where the host picks it up; the host later approves the
//! promotion and the session answers with a promote request once the
//! standby has flushed everything.

use super::errors::ReplicationResult;
use super::messages::{DemoteMode, SwitchoverResponseKind};
use super::registry::DemotionDecision;
use super::session::ReplicationSession;
use super::transport::Transport;
use crate::observability::{log_event_with_fields, Event};

impl<T: Transport> ReplicationSession<T> {
    pub(super) fn process_switchover_request(&mut self, code: i32) -> ReplicationResult<()> {
        let session_id = self.session_id().to_string();
        let requested = match DemoteMode::from_code(code) {
            Some(mode) if mode >= DemoteMode::Smart => mode,
            _ => {
                let code = code.to_string();
                log_event_with_fields(
                    Event::SwitchoverRejected,
                    &[
                        ("session", &session_id),
                        ("reason", "invalid demote mode"),
                        ("mode", &code),
                    ],
                );
                return Ok(());
            }
        };

        if self.ctx.registry.catchup_online() {
            self.send_switchover_response(SwitchoverResponseKind::DemoteCatchupExist)?;
            return Ok(());
        }

        match self.ctx.registry.request_demotion(self.demotion, requested) {
            DemotionDecision::Accepted => {
                self.demotion = requested;
                log_event_with_fields(
                    Event::SwitchoverRequested,
                    &[
                        ("session", &session_id),
                        ("application_name", &self.application_name),
                        ("mode", requested.as_str()),
                    ],
                );
                // wake the host and every session so keepalives carry the
                // demoting state
                self.ctx.registry.wake_all();
            }
            DemotionDecision::OtherInProgress => {
                let current = self.ctx.registry.demotion();
                log_event_with_fields(
                    Event::SwitchoverRejected,
                    &[
                        ("session", &session_id),
                        ("reason", "another demotion is in progress"),
                        ("mode", current.as_str()),
                    ],
                );
            }
            DemotionDecision::AlreadyRequested => {
                log_event_with_fields(
                    Event::SwitchoverRejected,
                    &[
                        ("session", &session_id),
                        ("reason", "demotion already requested"),
                        ("mode", self.demotion.as_str()),
                    ],
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::replication::clock::ManualClock;
    use crate::replication::config::SenderConfig;
    use crate::replication::messages::{SenderMessage, StandbyMessage};
    use crate::replication::protocol::{copy_data, StartupPacket};
    use crate::replication::session::SenderContext;
    use crate::replication::slots::SlotManager;
    use crate::replication::transport::{MemoryTransport, PeerHandle};
    use crate::wal::MemoryLog;

    fn session_in(ctx: &SenderContext) -> (ReplicationSession<MemoryTransport>, PeerHandle) {
        let (transport, peer) = MemoryTransport::new();
        let startup = StartupPacket::new(196_608).with_param("replication", "true");
        (
            ReplicationSession::start(ctx.clone(), &startup, transport).unwrap(),
            peer,
        )
    }

    fn context() -> SenderContext {
        SenderContext::new(
            SenderConfig::primary(),
            Arc::new(MemoryLog::new()),
            Arc::new(SlotManager::in_memory()),
            Arc::new(ManualClock::default()),
        )
    }

    fn request(mode: DemoteMode) -> crate::replication::protocol::Frame {
        copy_data(
            StandbyMessage::SwitchoverRequest {
                demote_mode: mode as i32,
                send_time: 0,
            }
            .encode(),
        )
    }

    #[test]
    fn test_accepted_request_signals_host() {
        let ctx = context();
        let (mut s, _peer) = session_in(&ctx);
        s.process_switchover_request(DemoteMode::Fast as i32).unwrap();
        assert_eq!(s.demotion, DemoteMode::Fast);
        assert_eq!(ctx.registry.take_demotion_signal(), Some(DemoteMode::Fast));
        assert!(s.handle.status().unwrap().demoting);
    }

    #[test]
    fn test_invalid_mode_ignored() {
        let ctx = context();
        let (mut s, _peer) = session_in(&ctx);
        s.process_switchover_request(0).unwrap();
        s.process_switchover_request(9).unwrap();
        assert_eq!(ctx.registry.demotion(), DemoteMode::NoDemote);
    }

    #[test]
    fn test_second_session_cannot_hijack_demotion() {
        let ctx = context();
        let (mut a, _pa) = session_in(&ctx);
        let (mut b, _pb) = session_in(&ctx);
        a.process_switchover_request(DemoteMode::Smart as i32).unwrap();
        b.process_switchover_request(DemoteMode::Fast as i32).unwrap();
        assert_eq!(ctx.registry.demotion(), DemoteMode::Smart);
        assert_eq!(b.demotion, DemoteMode::NoDemote);

        // the owner may escalate
        a.process_switchover_request(DemoteMode::Fast as i32).unwrap();
        assert_eq!(ctx.registry.demotion(), DemoteMode::Fast);
    }

    #[test]
    fn test_catchup_online_answers_immediately() {
        let ctx = context();
        ctx.registry.set_catchup_online(true);
        let (mut s, peer) = session_in(&ctx);
        peer.push_frame(request(DemoteMode::Smart));
        s.process_replies().unwrap();
        s.transport.flush().unwrap();
        let answered = peer
            .delivered()
            .iter()
            .filter_map(|f| f.copy_payload())
            .filter_map(|p| SenderMessage::decode(p).ok())
            .any(|m| {
                matches!(
                    m,
                    SenderMessage::SwitchoverResponse {
                        response: SwitchoverResponseKind::DemoteCatchupExist,
                        ..
                    }
                )
            });
        assert!(answered);
        assert_eq!(ctx.registry.demotion(), DemoteMode::NoDemote);
    }
}
