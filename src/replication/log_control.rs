//! Adaptive pacing toward a target recovery-time objective
//!
//! A discrete feedback loop driven by standby replies:
//!
//! 1. Sample the standby's flush and apply throughput, smoothed 7/8 old
//!    and 1/8 new. Rates are kept scaled by 8 so the integer division
//!    keeps three extra bits.
//! 2. Estimate the RTO in whole seconds from the unflushed and unapplied
//!    backlog.
//! 3. Move the per-reply sleep by a fixed step toward the target, or snap
//!    to the last balanced sleep once inside the tolerance band.
//! 4. Resize the sampling window so roughly one sample lands per second.
//!
//! Sleep is clamped to `[0, max_sleep]`. Samples with non-monotonic
//! positions or non-positive elapsed time are dropped.

use std::time::Duration;

use serde::Serialize;

use super::config::LogControlTuning;
use super::messages::StandbyReply;
use crate::observability::{log_event_with_fields, Event};
use crate::wal::LogPosition;

const SHIFT_SPEED: u32 = 3;

/// Outcome of a sleep recalculation that operators care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingTransition {
    /// Sleep went from zero to positive.
    Engaged,
    /// Sleep returned to zero.
    Released,
}

/// Copy of the controller state for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogControlStats {
    pub target_rto_secs: i64,
    pub current_rto_secs: i64,
    pub sleep_time_us: i64,
    pub balance_sleep_us: i64,
    pub flush_rate_bytes_per_ms: u64,
    pub apply_rate_bytes_per_ms: u64,
    pub sleep_count: u64,
    pub sleep_count_limit: u64,
}

/// Per-session pacing controller.
#[derive(Debug, Clone)]
pub struct LogControl {
    tuning: LogControlTuning,
    target_rto: i64,
    current_rto: i64,
    prev_rto: i64,
    sleep_us: i64,
    balance_sleep_us: i64,
    rate1: u64,
    rate2: u64,
    prev_reply_time: i64,
    prev_flush: LogPosition,
    prev_apply: LogPosition,
    sleep_count: u64,
    sleep_count_limit: u64,
}

impl LogControl {
    pub fn new(target_rto_secs: i64, tuning: LogControlTuning) -> Self {
        Self {
            tuning,
            target_rto: target_rto_secs,
            current_rto: -1,
            prev_rto: -1,
            sleep_us: 0,
            balance_sleep_us: 0,
            rate1: 0,
            rate2: 0,
            prev_reply_time: 0,
            prev_flush: LogPosition::INVALID,
            prev_apply: LogPosition::INVALID,
            sleep_count: 0,
            sleep_count_limit: tuning.max_sample_window,
        }
    }

    pub fn target_rto(&self) -> i64 {
        self.target_rto
    }

    /// Latest estimate in seconds, `-1` before the first estimate.
    pub fn current_rto(&self) -> i64 {
        self.current_rto
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_micros(self.sleep_us.max(0) as u64)
    }

    pub fn balance_sleep(&self) -> Duration {
        Duration::from_micros(self.balance_sleep_us.max(0) as u64)
    }

    pub fn sleep_count_limit(&self) -> u64 {
        self.sleep_count_limit
    }

    fn max_sleep_us(&self) -> i64 {
        self.tuning.max_sleep.as_micros() as i64
    }

    fn step_us(&self) -> i64 {
        self.tuning.step.as_micros() as i64
    }

    fn smooth(prev: u64, now: u64) -> u64 {
        if prev == 0 {
            now << SHIFT_SPEED
        } else {
            (((prev << SHIFT_SPEED) - prev) >> SHIFT_SPEED) + now
        }
    }

    /// Update throughput estimates and the RTO from one reply.
    ///
    /// Returns the new estimate, or `None` when the sample was dropped.
    pub fn calculate_current_rto(&mut self, reply: &StandbyReply) -> Option<i64> {
        if reply.receive < reply.flush
            || reply.flush < reply.apply
            || reply.flush < self.prev_flush
            || reply.apply < self.prev_apply
        {
            return None;
        }
        if self.prev_reply_time == 0 {
            return None;
        }

        let elapsed_ms = (reply.send_time - self.prev_reply_time) / 1000;
        if elapsed_ms <= 0 {
            return None;
        }
        let elapsed_ms = elapsed_ms as u64;

        let unflushed = reply.receive.distance_from(reply.flush);
        let unapplied = reply.flush.distance_from(reply.apply);
        let flushed_delta = reply.flush.distance_from(self.prev_flush);
        let applied_delta = reply.apply.distance_from(self.prev_apply);

        self.rate1 = Self::smooth(self.rate1, flushed_delta / elapsed_ms);
        self.rate2 = Self::smooth(self.rate2, applied_delta / elapsed_ms);

        let flush_rate = self.rate1 >> SHIFT_SPEED;
        let apply_rate = self.rate2 >> SHIFT_SPEED;
        if flush_rate == 0 || apply_rate == 0 {
            return None;
        }

        let part1 = (unflushed / flush_rate) / 1000;
        let part2 = ((unflushed + unapplied) / apply_rate) / 1000;
        self.prev_rto = self.current_rto;
        self.current_rto = part1.max(part2) as i64;
        Some(self.current_rto)
    }

    /// Remember this reply as the base of the next sample.
    pub fn record_sample(&mut self, reply: &StandbyReply) {
        self.prev_reply_time = reply.send_time;
        self.prev_flush = reply.flush;
        self.prev_apply = reply.apply;
    }

    /// Step the sleep time toward the target.
    pub fn calculate_sleep_time(&mut self) -> Option<PacingTransition> {
        if self.prev_rto < 0 {
            self.prev_rto = self.current_rto;
            return None;
        }

        let band = self.target_rto / self.tuning.tolerance_divisor;
        let gap = self.current_rto - self.target_rto;
        let prev_gap = self.prev_rto - self.target_rto;
        let gap_diff = gap - prev_gap;
        let before = self.sleep_us;

        if gap_diff.abs() <= band {
            self.balance_sleep_us = before;
        }

        if gap.abs() <= band {
            self.sleep_us = if self.balance_sleep_us != 0 {
                self.balance_sleep_us
            } else {
                (before - self.step_us()).max(0)
            };
        } else if gap > band {
            self.sleep_us = (before + self.step_us()).min(self.max_sleep_us());
        } else {
            self.sleep_us = (before - self.step_us()).max(0);
        }

        let transition = match (before == 0, self.sleep_us == 0) {
            (true, false) => Some(PacingTransition::Engaged),
            (false, true) => Some(PacingTransition::Released),
            _ => None,
        };
        if let Some(t) = transition {
            let target = self.target_rto.to_string();
            let current = self.current_rto.to_string();
            let sleep = self.sleep_us.to_string();
            let event = match t {
                PacingTransition::Engaged => Event::LogControlEngaged,
                PacingTransition::Released => Event::LogControlReleased,
            };
            log_event_with_fields(
                event,
                &[
                    ("target_rto", &target),
                    ("current_rto", &current),
                    ("sleep_us", &sleep),
                ],
            );
        }
        transition
    }

    /// Size the sampling window so about one sample lands per second.
    pub fn count_sleep_limit(&mut self) {
        let max = self.tuning.max_sample_window;
        let limit = if self.sleep_us == 0 {
            max
        } else {
            ((1_000_000 / self.sleep_us) as u64).min(max)
        };
        self.sleep_count_limit = if limit == 0 { 1 } else { limit };
    }

    /// Feed one standby reply. Returns how long the sender should pause.
    pub fn on_reply(&mut self, reply: &StandbyReply, streaming: bool) -> Duration {
        let window = self.sleep_count % self.sleep_count_limit == 0;
        if window {
            self.calculate_current_rto(reply);
            self.record_sample(reply);
        }

        let mut pause = Duration::ZERO;
        if streaming && self.target_rto > 0 {
            if window {
                self.calculate_sleep_time();
                self.count_sleep_limit();
            }
            pause = self.sleep_time();
        }
        self.sleep_count += 1;
        pause
    }

    pub fn stats(&self) -> LogControlStats {
        LogControlStats {
            target_rto_secs: self.target_rto,
            current_rto_secs: self.current_rto,
            sleep_time_us: self.sleep_us,
            balance_sleep_us: self.balance_sleep_us,
            flush_rate_bytes_per_ms: self.rate1 >> SHIFT_SPEED,
            apply_rate_bytes_per_ms: self.rate2 >> SHIFT_SPEED,
            sleep_count: self.sleep_count,
            sleep_count_limit: self.sleep_count_limit,
        }
    }
}
