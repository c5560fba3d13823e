//! Shared registry of sender sessions
//!
//! Each session owns one registry slot for its lifetime. The slot holds a
//! copyable [`SenderStatus`] behind a short mutex and the session latch.
//! Readers (monitoring, sync replication, other sessions) copy statuses
//! out and never hold a slot lock while doing anything else.
//!
//! Process-wide flags live here too: immediate shutdown, the last-cycle
//! stop, catchup-online, the pending demotion, and the out-of-band
//! heartbeat.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use super::clock::Latch;
use super::errors::{ReplicationError, ReplicationResult};
use super::log_control::LogControlStats;
use super::messages::DemoteMode;
use super::state::{DbState, SenderRole, ServerMode, WalSndState};
use crate::observability::SenderMetrics;
use crate::wal::LogPosition;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Published summary of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderStatus {
    pub session_id: Uuid,
    pub application_name: String,
    pub role: SenderRole,
    pub state: WalSndState,
    pub sent: LogPosition,
    pub receive: LogPosition,
    pub write: LogPosition,
    pub flush: LogPosition,
    pub apply: LogPosition,
    pub peer_role: ServerMode,
    pub peer_state: DbState,
    pub xmin: u64,
    pub sync_priority: u32,
    /// Bytes between `sent` and the flush point at the last send.
    pub catchup_backlog: u64,
    pub caught_up: bool,
    /// Set on every session while a switchover is pending.
    pub demoting: bool,
    /// Microseconds; zero until the first reply.
    pub last_reply_time: i64,
    pub log_control: LogControlStats,
}

impl SenderStatus {
    fn new(session_id: Uuid, application_name: &str, role: SenderRole, sync_priority: u32) -> Self {
        Self {
            session_id,
            application_name: application_name.to_string(),
            role,
            state: WalSndState::Startup,
            sent: LogPosition::INVALID,
            receive: LogPosition::INVALID,
            write: LogPosition::INVALID,
            flush: LogPosition::INVALID,
            apply: LogPosition::INVALID,
            peer_role: ServerMode::Unknown,
            peer_state: DbState::Unknown,
            xmin: 0,
            sync_priority,
            catchup_backlog: 0,
            caught_up: false,
            demoting: false,
            last_reply_time: 0,
            log_control: LogControlStats::default(),
        }
    }
}

/// Synchronous replication standing of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Async,
    Potential,
    Sync,
}

/// Monitoring row, one per active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderRow {
    pub session_id: Uuid,
    pub application_name: String,
    pub role: &'static str,
    pub state: &'static str,
    pub sent: String,
    pub write: String,
    pub flush: String,
    pub apply: String,
    pub sync_priority: u32,
    pub sync_state: SyncState,
    pub catchup_backlog: u64,
    pub last_reply_time: i64,
    pub log_control: LogControlStats,
}

/// A snapshot exported by CREATE_REPLICATION_SLOT ... LOGICAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedSnapshot {
    pub name: String,
    pub consistent_point: LogPosition,
    pub xmin: u64,
    pub exporter: Uuid,
}

/// Outcome of a switchover request against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemotionDecision {
    Accepted,
    /// Another session's switchover is in progress.
    OtherInProgress,
    /// This session already asked for an equal or stronger mode.
    AlreadyRequested,
}

/// Commit waiters released as synchronous standbys confirm flushes.
#[derive(Debug, Default)]
pub struct SyncRepWaiters {
    released: Mutex<LogPosition>,
    cond: Condvar,
}

impl SyncRepWaiters {
    pub fn released(&self) -> LogPosition {
        *lock(&self.released)
    }

    /// Release every waiter at or below `position`.
    pub fn release(&self, position: LogPosition) {
        let mut released = lock(&self.released);
        if position > *released {
            *released = position;
            self.cond.notify_all();
        }
    }

    /// Block until `position` is confirmed or `timeout` passes.
    pub fn wait_for(&self, position: LogPosition, timeout: Duration) -> bool {
        let guard = lock(&self.released);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |r| *r < position)
            .unwrap_or_else(|p| p.into_inner());
        *guard >= position
    }
}

struct SenderSlot {
    status: Mutex<Option<SenderStatus>>,
    latch: Arc<Latch>,
    promote: AtomicBool,
}

/// Registry shared by every session of a server.
pub struct SenderRegistry {
    slots: Vec<SenderSlot>,
    shutdown: AtomicBool,
    last_cycle: AtomicBool,
    catchup_online: AtomicBool,
    demotion: Mutex<DemoteMode>,
    demotion_signalled: AtomicBool,
    heartbeat: AtomicI64,
    snapshots: Mutex<HashMap<String, ExportedSnapshot>>,
    snapshot_seq: AtomicU64,
    sync_waiters: SyncRepWaiters,
    metrics: SenderMetrics,
}

impl SenderRegistry {
    pub fn new(max_senders: usize) -> Self {
        let slots = (0..max_senders)
            .map(|_| SenderSlot {
                status: Mutex::new(None),
                latch: Arc::new(Latch::new()),
                promote: AtomicBool::new(false),
            })
            .collect();
        Self {
            slots,
            shutdown: AtomicBool::new(false),
            last_cycle: AtomicBool::new(false),
            catchup_online: AtomicBool::new(false),
            demotion: Mutex::new(DemoteMode::NoDemote),
            demotion_signalled: AtomicBool::new(false),
            heartbeat: AtomicI64::new(0),
            snapshots: Mutex::new(HashMap::new()),
            snapshot_seq: AtomicU64::new(0),
            sync_waiters: SyncRepWaiters::default(),
            metrics: SenderMetrics::new(),
        }
    }

    pub fn max_senders(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot. Fails when every slot is taken.
    pub fn register(
        self: &Arc<Self>,
        application_name: &str,
        role: SenderRole,
        sync_priority: u32,
    ) -> ReplicationResult<SenderHandle> {
        let session_id = Uuid::new_v4();
        for (index, slot) in self.slots.iter().enumerate() {
            let mut status = lock(&slot.status);
            if status.is_none() {
                *status = Some(SenderStatus::new(
                    session_id,
                    application_name,
                    role,
                    sync_priority,
                ));
                slot.promote.store(false, Ordering::SeqCst);
                slot.latch.reset();
                return Ok(SenderHandle {
                    registry: Arc::clone(self),
                    index,
                    session_id,
                });
            }
        }
        Err(ReplicationError::too_many_senders(self.slots.len()))
    }

    fn statuses(&self) -> Vec<SenderStatus> {
        self.slots
            .iter()
            .filter_map(|s| lock(&s.status).clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| lock(&s.status).is_some())
            .count()
    }

    pub fn status_of(&self, session_id: Uuid) -> Option<SenderStatus> {
        self.statuses()
            .into_iter()
            .find(|s| s.session_id == session_id)
    }

    /// Set every session latch. Called when new log is flushed.
    pub fn wake_all(&self) {
        for slot in &self.slots {
            slot.latch.set();
        }
    }

    /// Stop every session now, without sending what is left.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Ask every session to send the remaining flushed log, wait for the
    /// standby to confirm it, then stop.
    pub fn request_last_cycle(&self) {
        self.last_cycle.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    pub fn last_cycle_requested(&self) -> bool {
        self.last_cycle.load(Ordering::SeqCst)
    }

    pub fn set_catchup_online(&self, online: bool) {
        self.catchup_online.store(online, Ordering::SeqCst);
        self.wake_all();
    }

    pub fn catchup_online(&self) -> bool {
        self.catchup_online.load(Ordering::SeqCst)
    }

    /// Record a heartbeat seen on another channel.
    pub fn record_heartbeat(&self, micros: i64) {
        self.heartbeat.fetch_max(micros, Ordering::SeqCst);
    }

    pub fn last_heartbeat(&self) -> i64 {
        self.heartbeat.load(Ordering::SeqCst)
    }

    pub fn demotion(&self) -> DemoteMode {
        *lock(&self.demotion)
    }

    /// Apply a switchover request from a session whose own recorded mode
    /// is `own`.
    pub fn request_demotion(&self, own: DemoteMode, requested: DemoteMode) -> DemotionDecision {
        let mut demotion = lock(&self.demotion);
        if *demotion > DemoteMode::NoDemote && own != *demotion {
            return DemotionDecision::OtherInProgress;
        }
        if requested <= own {
            return DemotionDecision::AlreadyRequested;
        }
        *demotion = requested;
        for slot in &self.slots {
            if let Some(status) = lock(&slot.status).as_mut() {
                status.demoting = true;
            }
        }
        self.demotion_signalled.store(true, Ordering::SeqCst);
        DemotionDecision::Accepted
    }

    /// Clear a pending demotion on every session.
    pub fn reset_demotion(&self) {
        let mut demotion = lock(&self.demotion);
        *demotion = DemoteMode::NoDemote;
        for slot in &self.slots {
            if let Some(status) = lock(&slot.status).as_mut() {
                status.demoting = false;
            }
        }
        self.demotion_signalled.store(false, Ordering::SeqCst);
    }

    /// Host side: consume the "demote the primary" signal.
    pub fn take_demotion_signal(&self) -> Option<DemoteMode> {
        if self.demotion_signalled.swap(false, Ordering::SeqCst) {
            Some(self.demotion())
        } else {
            None
        }
    }

    /// Host side: allow `session_id` to finish its switchover.
    pub fn approve_promotion(&self, session_id: Uuid) -> bool {
        for slot in &self.slots {
            let matches = lock(&slot.status)
                .as_ref()
                .map(|s| s.session_id == session_id)
                .unwrap_or(false);
            if matches {
                slot.promote.store(true, Ordering::SeqCst);
                slot.latch.set();
                return true;
            }
        }
        false
    }

    /// Whether any regular standby is streaming and fully caught up.
    pub fn standby_caught_up(&self) -> bool {
        self.statuses().iter().any(|s| {
            s.role == SenderRole::Standby && s.state == WalSndState::Streaming && s.caught_up
        })
    }

    /// Whether a regular standby other than `except` is streaming.
    pub fn standby_streaming(&self, except: Uuid) -> bool {
        self.statuses().iter().any(|s| {
            s.session_id != except
                && matches!(s.role, SenderRole::Standby | SenderRole::BuildStandby)
                && s.state == WalSndState::Streaming
        })
    }

    fn sync_session(statuses: &[SenderStatus]) -> Option<Uuid> {
        statuses
            .iter()
            .filter(|s| s.sync_priority > 0 && s.state == WalSndState::Streaming)
            .min_by_key(|s| s.sync_priority)
            .map(|s| s.session_id)
    }

    /// Release commit waiters up to the current synchronous standby's flush.
    pub fn release_sync_waiters(&self) {
        let statuses = self.statuses();
        if let Some(id) = Self::sync_session(&statuses) {
            if let Some(status) = statuses.iter().find(|s| s.session_id == id) {
                self.sync_waiters.release(status.flush);
            }
        }
    }

    pub fn sync_waiters(&self) -> &SyncRepWaiters {
        &self.sync_waiters
    }

    pub fn metrics(&self) -> &SenderMetrics {
        &self.metrics
    }

    /// Export a snapshot under a new name so another session can import it.
    pub fn export_snapshot(
        &self,
        exporter: Uuid,
        consistent_point: LogPosition,
        xmin: u64,
    ) -> String {
        let seq = self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("{:08X}-{}", consistent_point.high(), seq);
        lock(&self.snapshots).insert(
            name.clone(),
            ExportedSnapshot {
                name: name.clone(),
                consistent_point,
                xmin,
                exporter,
            },
        );
        name
    }

    pub fn import_snapshot(&self, name: &str) -> Option<ExportedSnapshot> {
        lock(&self.snapshots).get(name).cloned()
    }

    fn release_snapshots(&self, exporter: Uuid) {
        lock(&self.snapshots).retain(|_, s| s.exporter != exporter);
    }

    /// One monitoring row per active session.
    pub fn snapshot(&self) -> Vec<SenderRow> {
        let statuses = self.statuses();
        let sync = Self::sync_session(&statuses);
        statuses
            .into_iter()
            .map(|s| {
                let sync_state = if s.sync_priority == 0 {
                    SyncState::Async
                } else if Some(s.session_id) == sync {
                    SyncState::Sync
                } else {
                    SyncState::Potential
                };
                SenderRow {
                    session_id: s.session_id,
                    application_name: s.application_name,
                    role: s.role.as_str(),
                    state: s.state.as_str(),
                    sent: s.sent.to_string(),
                    write: s.write.to_string(),
                    flush: s.flush.to_string(),
                    apply: s.apply.to_string(),
                    sync_priority: s.sync_priority,
                    sync_state,
                    catchup_backlog: s.catchup_backlog,
                    last_reply_time: s.last_reply_time,
                    log_control: s.log_control,
                }
            })
            .collect()
    }
}

/// A session's claim on its registry slot. Dropping it frees the slot.
pub struct SenderHandle {
    registry: Arc<SenderRegistry>,
    index: usize,
    session_id: Uuid,
}

impl SenderHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn registry(&self) -> &Arc<SenderRegistry> {
        &self.registry
    }

    pub fn latch(&self) -> Arc<Latch> {
        Arc::clone(&self.registry.slots[self.index].latch)
    }

    /// Mutate the published status under the slot lock.
    pub fn update<F: FnOnce(&mut SenderStatus)>(&self, f: F) {
        if let Some(status) = lock(&self.registry.slots[self.index].status).as_mut() {
            f(status);
        }
    }

    pub fn status(&self) -> Option<SenderStatus> {
        lock(&self.registry.slots[self.index].status).clone()
    }

    /// Consume a promotion approval, if the host gave one.
    pub fn take_promotion_approval(&self) -> bool {
        self.registry.slots[self.index]
            .promote
            .swap(false, Ordering::SeqCst)
    }
}

impl Drop for SenderHandle {
    fn drop(&mut self) {
        self.registry.release_snapshots(self.session_id);
        let slot = &self.registry.slots[self.index];
        *lock(&slot.status) = None;
        slot.promote.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(n: usize) -> Arc<SenderRegistry> {
        Arc::new(SenderRegistry::new(n))
    }

    #[test]
    fn test_register_until_full() {
        let reg = registry(2);
        let a = reg.register("a", SenderRole::Standby, 0).unwrap();
        let _b = reg.register("b", SenderRole::Standby, 0).unwrap();
        let err = reg
            .register("c", SenderRole::Standby, 0)
            .err()
            .expect("third register should fail");
        assert!(err.message.contains("exceeds max_wal_senders"));

        drop(a);
        assert_eq!(reg.active_count(), 1);
        assert!(reg.register("c", SenderRole::Standby, 0).is_ok());
    }

    #[test]
    fn test_sync_state_picks_lowest_priority_streamer() {
        let reg = registry(3);
        let a = reg.register("a", SenderRole::Standby, 2).unwrap();
        let b = reg.register("b", SenderRole::Standby, 1).unwrap();
        let c = reg.register("c", SenderRole::Standby, 0).unwrap();
        for h in [&a, &b, &c] {
            h.update(|s| s.state = WalSndState::Streaming);
        }
        let rows = reg.snapshot();
        let state_of = |name: &str| {
            rows.iter()
                .find(|r| r.application_name == name)
                .map(|r| r.sync_state)
        };
        assert_eq!(state_of("a"), Some(SyncState::Potential));
        assert_eq!(state_of("b"), Some(SyncState::Sync));
        assert_eq!(state_of("c"), Some(SyncState::Async));
    }

    #[test]
    fn test_sync_waiters_released_by_sync_flush() {
        let reg = registry(1);
        let h = reg.register("a", SenderRole::Standby, 1).unwrap();
        h.update(|s| {
            s.state = WalSndState::Streaming;
            s.flush = LogPosition::new(500);
        });
        reg.release_sync_waiters();
        assert!(reg
            .sync_waiters()
            .wait_for(LogPosition::new(400), Duration::from_millis(1)));
        assert!(!reg
            .sync_waiters()
            .wait_for(LogPosition::new(600), Duration::from_millis(1)));
    }

    #[test]
    fn test_demotion_rules() {
        let reg = registry(2);
        let _a = reg.register("a", SenderRole::Standby, 0).unwrap();
        assert_eq!(
            reg.request_demotion(DemoteMode::NoDemote, DemoteMode::Smart),
            DemotionDecision::Accepted
        );
        assert_eq!(reg.take_demotion_signal(), Some(DemoteMode::Smart));
        assert_eq!(reg.take_demotion_signal(), None);

        // a different session that never asked
        assert_eq!(
            reg.request_demotion(DemoteMode::NoDemote, DemoteMode::Fast),
            DemotionDecision::OtherInProgress
        );
        // the same session repeating itself
        assert_eq!(
            reg.request_demotion(DemoteMode::Smart, DemoteMode::Smart),
            DemotionDecision::AlreadyRequested
        );
        // the same session escalating
        assert_eq!(
            reg.request_demotion(DemoteMode::Smart, DemoteMode::Fast),
            DemotionDecision::Accepted
        );
        assert!(reg.snapshot().len() == 1);

        reg.reset_demotion();
        assert_eq!(reg.demotion(), DemoteMode::NoDemote);
    }

    #[test]
    fn test_last_cycle_wakes_sessions_without_shutdown() {
        let reg = registry(2);
        let h = reg.register("a", SenderRole::Standby, 0).unwrap();
        reg.request_last_cycle();
        assert!(reg.last_cycle_requested());
        assert!(!reg.shutdown_requested());
        assert!(h.latch().is_set());
    }

    #[test]
    fn test_promotion_approval_sets_latch() {
        let reg = registry(1);
        let h = reg.register("a", SenderRole::Standby, 0).unwrap();
        assert!(reg.approve_promotion(h.session_id()));
        assert!(h.latch().is_set());
        assert!(h.take_promotion_approval());
        assert!(!h.take_promotion_approval());
        assert!(!reg.approve_promotion(Uuid::new_v4()));
    }

    #[test]
    fn test_exported_snapshot_dies_with_exporter() {
        let reg = registry(1);
        let h = reg.register("a", SenderRole::Standby, 0).unwrap();
        let name = reg.export_snapshot(h.session_id(), LogPosition::new(0x1_0000_0010), 7);
        assert_eq!(name, "00000001-1");
        assert_eq!(reg.import_snapshot(&name).map(|s| s.xmin), Some(7));
        drop(h);
        assert!(reg.import_snapshot(&name).is_none());
    }

    #[test]
    fn test_heartbeat_never_moves_back() {
        let reg = registry(1);
        reg.record_heartbeat(100);
        reg.record_heartbeat(50);
        assert_eq!(reg.last_heartbeat(), 100);
    }
}
