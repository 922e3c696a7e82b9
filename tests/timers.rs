//! Timed waits, periodic activation and round-robin rotation.

mod common;

use common::{TEST_RESOLUTION, rig};
use janus::Error;
use janus::clock::{MILLIS, Timeout};
use janus::thread::policy::SchedParam;
use janus::thread::ThreadState;

#[test]
fn sleep_completes_on_timer_expiry() {
    let r = rig(1);
    let (_id, tok, _) = r.oob_thread("dozer", SchedParam::Fifo { prio: 10 });

    let core = r.core.clone();
    let clock = r.clock.clone();
    r.set_pump(move || {
        clock.advance(5 * MILLIS);
        core.tick(0);
    });

    let before = r.clock.now();
    assert_eq!(r.core.sleep(&tok, 2 * MILLIS), Ok(()));
    assert!(r.clock.now() >= before + 2 * MILLIS);
}

#[test]
fn sleep_reports_interruption() {
    let r = rig(1);
    let (id, tok, _) = r.oob_thread("dozer", SchedParam::Fifo { prio: 10 });

    let core = r.core.clone();
    r.set_pump(move || {
        let _ = core.unblock(id);
    });
    assert_eq!(r.core.sleep(&tok, 10 * MILLIS), Err(Error::Interrupted));
}

#[test]
fn sleep_until_honors_absolute_deadlines() {
    let r = rig(1);
    let (_id, tok, _) = r.oob_thread("dozer", SchedParam::Fifo { prio: 10 });

    let deadline = r.clock.now() + 7 * MILLIS;
    let core = r.core.clone();
    let clock = r.clock.clone();
    r.set_pump(move || {
        clock.advance(MILLIS);
        core.tick(0);
    });
    assert_eq!(r.core.sleep_until(&tok, deadline), Ok(()));
    assert!(r.clock.now() >= deadline);
}

#[test]
fn first_wait_after_missed_periods_reports_overruns() {
    // Scenario: 10ms period armed, 35ms elapse before the first wait; three
    // activations have passed, one is consumed by the call, two are
    // overruns.
    let r = rig(1);
    let (_id, tok, _) = r.oob_thread("periodic", SchedParam::Fifo { prio: 10 });

    r.core.set_period(&tok, 0, 10 * MILLIS).unwrap();
    r.clock.advance(35 * MILLIS);
    assert_eq!(r.core.wait_period(&tok), Ok(2));
}

#[test]
fn wait_period_blocks_until_activation() {
    let r = rig(1);
    let (_id, tok, _) = r.oob_thread("periodic", SchedParam::Fifo { prio: 10 });

    r.core.set_period(&tok, 0, 10 * MILLIS).unwrap();
    let core = r.core.clone();
    let clock = r.clock.clone();
    r.set_pump(move || {
        clock.advance(10 * MILLIS);
        core.tick(0);
    });
    assert_eq!(r.core.wait_period(&tok), Ok(0));
    assert_eq!(r.core.wait_period(&tok), Ok(0));
}

#[test]
fn wait_period_reports_interruption() {
    let r = rig(1);
    let (id, tok, _) = r.oob_thread("periodic", SchedParam::Fifo { prio: 10 });

    r.core.set_period(&tok, 0, 10 * MILLIS).unwrap();
    let core = r.core.clone();
    r.set_pump(move || {
        let _ = core.unblock(id);
    });
    assert_eq!(r.core.wait_period(&tok), Err(Error::Interrupted));
}

#[test]
fn period_validation() {
    let r = rig(1);
    let (_id, tok, _) = r.oob_thread("periodic", SchedParam::Fifo { prio: 10 });

    // No period armed yet.
    assert_eq!(r.core.wait_period(&tok), Err(Error::Again));
    // Below the clock's granularity.
    assert_eq!(
        r.core.set_period(&tok, 0, TEST_RESOLUTION / 2),
        Err(Error::InvalidArgument)
    );
    // A null period cancels periodic mode.
    r.core.set_period(&tok, 0, 10 * MILLIS).unwrap();
    r.core.set_period(&tok, 0, 0).unwrap();
    assert_eq!(r.core.wait_period(&tok), Err(Error::Again));
}

#[test]
fn round_robin_rotates_equal_priorities() {
    let r = rig(1);
    let quantum = 5 * MILLIS;
    let (a, _ta, _) = r.oob_thread("rr-a", SchedParam::RoundRobin { prio: 5, quantum });
    let (b, _tb, _) = r.oob_thread("rr-b", SchedParam::RoundRobin { prio: 5, quantum });
    assert_eq!(r.core.current_on(0), a);
    assert!(r.core.thread_state(a).unwrap().contains(ThreadState::RRB));

    r.clock.advance(quantum);
    r.core.tick(0);
    assert_eq!(r.core.current_on(0), b);

    r.clock.advance(quantum);
    r.core.tick(0);
    assert_eq!(r.core.current_on(0), a);
}

#[test]
fn quantum_does_not_preempt_lone_thread() {
    let r = rig(1);
    let quantum = 5 * MILLIS;
    let (a, _ta, _) = r.oob_thread("rr-solo", SchedParam::RoundRobin { prio: 5, quantum });

    r.clock.advance(quantum);
    r.core.tick(0);
    assert_eq!(r.core.current_on(0), a);
}

#[test]
fn snapshot_reports_remaining_timeout() {
    let r = rig(1);
    let (id, _tok, _) = r.oob_thread("timed", SchedParam::Fifo { prio: 10 });

    r.core
        .suspend_thread(id, ThreadState::DELAY, Timeout::After(10 * MILLIS))
        .unwrap();
    let remaining = r.core.thread_snapshot(id).unwrap().timeout.unwrap();
    assert_eq!(remaining, 10 * MILLIS);

    r.clock.advance(4 * MILLIS);
    let remaining = r.core.thread_snapshot(id).unwrap().timeout.unwrap();
    assert_eq!(remaining, 6 * MILLIS);

    r.core.resume_thread(id, ThreadState::DELAY).unwrap();
    assert!(r.core.thread_snapshot(id).unwrap().timeout.is_none());
}
