//! Time and wake-ups for session workers
//!
//! Sessions never read the system time or sleep directly. They go through
//! a [`Clock`], so tests drive timeouts and pacing with a [`ManualClock`]
//! instead of real sleeps.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use chrono::Utc;

/// Wake-up flag a session waits on. Set by new flushed log, peer input,
/// shutdown requests and switchover approval.
#[derive(Debug, Default)]
pub struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        *set = true;
        self.cond.notify_all();
    }

    /// Clear the flag, returning whether it was set.
    pub fn reset(&self) -> bool {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *set, false)
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Block until set or `timeout` elapses. Consumes the flag.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.set.lock().unwrap_or_else(|p| p.into_inner());
        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *guard, false)
    }
}

/// Time source for a session.
pub trait Clock: Send + Sync {
    /// Microseconds since the Unix epoch.
    fn now_micros(&self) -> i64;

    fn sleep(&self, duration: Duration);

    /// Wait on `latch` for at most `timeout`. Returns true when woken.
    fn wait_latch(&self, latch: &Latch, timeout: Duration) -> bool;

    fn now_millis(&self) -> i64 {
        self.now_micros() / 1000
    }
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        Utc::now().timestamp_micros()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }

    fn wait_latch(&self, latch: &Latch, timeout: Duration) -> bool {
        latch.wait_timeout(timeout)
    }
}

/// Clock that only moves when told to. Waits and sleeps advance it
/// instantly by the requested amount.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
    slept: AtomicI64,
}

impl ManualClock {
    pub fn new(start_micros: i64) -> Self {
        Self {
            now: AtomicI64::new(start_micros),
            slept: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now
            .fetch_add(duration.as_micros() as i64, Ordering::SeqCst);
    }

    /// Total time spent in [`Clock::sleep`], for pacing assertions.
    pub fn total_slept(&self) -> Duration {
        Duration::from_micros(self.slept.load(Ordering::SeqCst) as u64)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z
        Self::new(1_704_067_200_000_000)
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.slept
            .fetch_add(duration.as_micros() as i64, Ordering::SeqCst);
        self.advance(duration);
    }

    fn wait_latch(&self, latch: &Latch, timeout: Duration) -> bool {
        if latch.reset() {
            return true;
        }
        self.advance(timeout);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_set_then_wait_returns_immediately() {
        let latch = Latch::new();
        latch.set();
        assert!(latch.wait_timeout(Duration::from_secs(5)));
        assert!(!latch.is_set());
    }

    #[test]
    fn test_latch_times_out() {
        let latch = Latch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_manual_clock_wait_advances_time() {
        let clock = ManualClock::new(0);
        let latch = Latch::new();
        assert!(!clock.wait_latch(&latch, Duration::from_millis(100)));
        assert_eq!(clock.now_millis(), 100);

        latch.set();
        assert!(clock.wait_latch(&latch, Duration::from_millis(100)));
        assert_eq!(clock.now_millis(), 100);
    }

    #[test]
    fn test_manual_clock_tracks_sleep() {
        let clock = ManualClock::new(0);
        clock.sleep(Duration::from_millis(200));
        clock.sleep(Duration::from_millis(200));
        assert_eq!(clock.total_slept(), Duration::from_millis(400));
        assert_eq!(clock.now_millis(), 400);
    }
}
