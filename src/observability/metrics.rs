//! Sender counters
//!
//! - Counters only, monotonic
//! - Reset on process start
//! - Relaxed atomics; values are advisory

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide replication counters, shared by every session.
#[derive(Debug, Default)]
pub struct SenderMetrics {
    sessions_started: AtomicU64,
    sessions_terminated: AtomicU64,
    sessions_timed_out: AtomicU64,
    protocol_violations: AtomicU64,
    log_bytes_sent: AtomicU64,
    data_messages_sent: AtomicU64,
    keepalives_sent: AtomicU64,
    replies_processed: AtomicU64,
    replies_ignored: AtomicU64,
}

/// Point-in-time copy of [`SenderMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_terminated: u64,
    pub sessions_timed_out: u64,
    pub protocol_violations: u64,
    pub log_bytes_sent: u64,
    pub data_messages_sent: u64,
    pub keepalives_sent: u64,
    pub replies_processed: u64,
    pub replies_ignored: u64,
}

impl SenderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_terminated(&self) {
        self.sessions_terminated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_timed_out(&self) {
        self.sessions_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// One `'w'` message carrying `bytes` of log.
    pub fn data_sent(&self, bytes: u64) {
        self.data_messages_sent.fetch_add(1, Ordering::Relaxed);
        self.log_bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn keepalive_sent(&self) {
        self.keepalives_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_processed(&self) {
        self.replies_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_ignored(&self) {
        self.replies_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_terminated: self.sessions_terminated.load(Ordering::Relaxed),
            sessions_timed_out: self.sessions_timed_out.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            log_bytes_sent: self.log_bytes_sent.load(Ordering::Relaxed),
            data_messages_sent: self.data_messages_sent.load(Ordering::Relaxed),
            keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
            replies_processed: self.replies_processed.load(Ordering::Relaxed),
            replies_ignored: self.replies_ignored.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        assert_eq!(SenderMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_data_sent_counts_messages_and_bytes() {
        let m = SenderMetrics::new();
        m.data_sent(100);
        m.data_sent(28);
        let snap = m.snapshot();
        assert_eq!(snap.data_messages_sent, 2);
        assert_eq!(snap.log_bytes_sent, 128);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = SenderMetrics::new();
        m.session_started();
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["sessions_started"], 1);
    }
}
