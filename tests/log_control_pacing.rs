//! Log control pacing tests
//!
//! Runs the RTO controller through a lagging standby that later catches up:
//! - Sleep grows by one step per sample while the RTO is over target
//! - Sleep is capped at the configured maximum
//! - Sleep shrinks back to zero once the standby is ahead of target
//! - Inside the tolerance band sleep holds at the balanced value
//! - Pacing never applies outside streaming or without a target

use std::time::Duration;

use aerorepl::replication::{
    DbState, LogControl, LogControlTuning, PacingTransition, ServerMode, StandbyReply,
};
use aerorepl::wal::LogPosition;

// =============================================================================
// Fixtures
// =============================================================================

fn reply(t_ms: i64, receive: u64, flush: u64, apply: u64) -> StandbyReply {
    StandbyReply {
        receive: LogPosition::new(receive),
        write: LogPosition::new(receive),
        flush: LogPosition::new(flush),
        apply: LogPosition::new(apply),
        peer_role: ServerMode::Standby,
        peer_state: DbState::Normal,
        send_time: t_ms * 1000,
        reply_requested: false,
    }
}

/// One controller step: estimate, remember, then move the sleep.
fn step(ctl: &mut LogControl, r: &StandbyReply) -> (Option<i64>, Option<PacingTransition>) {
    let rto = ctl.calculate_current_rto(r);
    ctl.record_sample(r);
    let transition = ctl.calculate_sleep_time();
    ctl.count_sleep_limit();
    (rto, transition)
}

// =============================================================================
// Feedback loop
// =============================================================================

/// A standby with 15 s of backlog against a 10 s target is slowed one
/// step at a time up to the cap, then released step by step once it has
/// caught up.
#[test]
fn test_lag_then_recovery() {
    let mut ctl = LogControl::new(10, LogControlTuning::default());

    // baseline and first estimate never move the sleep
    assert_eq!(step(&mut ctl, &reply(1000, 16_000, 1_000, 1_000)), (None, None));
    assert_eq!(
        step(&mut ctl, &reply(2000, 17_000, 2_000, 2_000)),
        (Some(15), None)
    );
    assert_eq!(ctl.sleep_time(), Duration::ZERO);

    let mut sleeps = Vec::new();
    let mut transitions = Vec::new();
    for k in 3..=8i64 {
        let pos = (k * 1000) as u64;
        let (rto, transition) = step(&mut ctl, &reply(k * 1000, 15_000 + pos, pos, pos));
        assert_eq!(rto, Some(15));
        sleeps.push(ctl.sleep_time().as_millis());
        transitions.extend(transition);
    }
    assert_eq!(sleeps, vec![200, 400, 600, 800, 1000, 1000]);
    assert_eq!(transitions, vec![PacingTransition::Engaged]);
    assert_eq!(ctl.sleep_count_limit(), 1);

    sleeps.clear();
    transitions.clear();
    for k in 9..=13i64 {
        let pos = 40_000 + ((k - 9) * 1000) as u64;
        let (rto, transition) = step(&mut ctl, &reply(k * 1000, pos, pos, pos));
        assert_eq!(rto, Some(0));
        sleeps.push(ctl.sleep_time().as_millis());
        transitions.extend(transition);
    }
    assert_eq!(sleeps, vec![800, 600, 400, 200, 0]);
    assert_eq!(transitions, vec![PacingTransition::Released]);

    let stats = ctl.stats();
    assert_eq!(stats.current_rto_secs, 0);
    assert_eq!(stats.sleep_time_us, 0);
}

/// Once the estimate settles inside the tolerance band the sleep snaps to
/// the last balanced value and stays there.
#[test]
fn test_settles_on_balance_sleep() {
    let mut ctl = LogControl::new(10, LogControlTuning::default());
    step(&mut ctl, &reply(1000, 16_000, 1_000, 1_000));
    step(&mut ctl, &reply(2000, 17_000, 2_000, 2_000));
    for k in 3..=5i64 {
        let pos = (k * 1000) as u64;
        step(&mut ctl, &reply(k * 1000, 15_000 + pos, pos, pos));
    }
    assert_eq!(ctl.sleep_time(), Duration::from_millis(600));
    assert_eq!(ctl.balance_sleep(), Duration::from_millis(400));

    for k in 6..=8i64 {
        let pos = (k * 1000) as u64;
        let (rto, _) = step(&mut ctl, &reply(k * 1000, 10_000 + pos, pos, pos));
        assert_eq!(rto, Some(10));
        assert_eq!(ctl.sleep_time(), Duration::from_millis(400));
    }
}

/// A reply whose positions are out of order is not a sample and leaves
/// the estimate alone.
#[test]
fn test_inconsistent_reply_keeps_estimate() {
    let mut ctl = LogControl::new(10, LogControlTuning::default());
    step(&mut ctl, &reply(1000, 16_000, 1_000, 1_000));
    step(&mut ctl, &reply(2000, 17_000, 2_000, 2_000));
    assert_eq!(ctl.current_rto(), 15);

    // apply ahead of flush
    assert_eq!(
        ctl.calculate_current_rto(&reply(3000, 18_000, 3_000, 4_000)),
        None
    );
    assert_eq!(ctl.current_rto(), 15);
}

/// Custom tuning changes both the step and the cap.
#[test]
fn test_custom_step_and_cap() {
    let tuning = LogControlTuning {
        step: Duration::from_millis(50),
        max_sleep: Duration::from_millis(120),
        ..LogControlTuning::default()
    };
    let mut ctl = LogControl::new(10, tuning);
    step(&mut ctl, &reply(1000, 16_000, 1_000, 1_000));
    step(&mut ctl, &reply(2000, 17_000, 2_000, 2_000));

    let mut sleeps = Vec::new();
    for k in 3..=6i64 {
        let pos = (k * 1000) as u64;
        step(&mut ctl, &reply(k * 1000, 15_000 + pos, pos, pos));
        sleeps.push(ctl.sleep_time().as_millis());
    }
    assert_eq!(sleeps, vec![50, 100, 120, 120]);
}

// =============================================================================
// Reply path
// =============================================================================

/// Outside streaming the controller samples but never asks for a pause.
#[test]
fn test_no_pause_while_catching_up() {
    let mut ctl = LogControl::new(10, LogControlTuning::default());
    assert_eq!(
        ctl.on_reply(&reply(1000, 16_000, 1_000, 1_000), false),
        Duration::ZERO
    );
    assert_eq!(
        ctl.on_reply(&reply(2000, 17_000, 2_000, 2_000), false),
        Duration::ZERO
    );
    assert_eq!(ctl.stats().sleep_count, 2);
}

/// A zero target disables pacing even while streaming.
#[test]
fn test_zero_target_never_pauses() {
    let mut ctl = LogControl::new(0, LogControlTuning::default());
    for k in 1..=5i64 {
        let pos = (k * 1000) as u64;
        let pause = ctl.on_reply(&reply(k * 1000, 15_000 + pos, pos, pos), true);
        assert_eq!(pause, Duration::ZERO);
    }
    assert_eq!(ctl.sleep_time(), Duration::ZERO);
}
