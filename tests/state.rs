//! Suspend/resume state-machine properties.

mod common;

use common::rig;
use janus::Error;
use janus::clock::{MILLIS, Timeout};
use janus::sched::Unblocked;
use janus::thread::policy::SchedParam;
use janus::thread::{ThreadInfo, ThreadState};

#[test]
fn inband_excludes_oob_residency() {
    // P1: INBAND is set exactly while the thread is neither queued nor
    // selected as a run queue's current thread.
    let r = rig(1);
    let (id, itok, _) = r.user_thread("wanderer", SchedParam::Fifo { prio: 10 });

    let snap = r.core.thread_snapshot(id).unwrap();
    assert!(snap.state.contains(ThreadState::INBAND));
    assert!(!snap.state.contains(ThreadState::READY));
    assert_ne!(r.core.current_on(0), id);

    let otok = r.core.switch_to_oob(itok).ok().unwrap();
    let snap = r.core.thread_snapshot(id).unwrap();
    assert!(!snap.state.contains(ThreadState::INBAND));
    assert!(snap.state.contains(ThreadState::READY));
    assert_eq!(r.core.current_on(0), id);

    let _itok = r.core.switch_to_inband(otok, janus::sched::switch::InbandCause::Undefined);
    let snap = r.core.thread_snapshot(id).unwrap();
    assert!(snap.state.contains(ThreadState::INBAND));
    assert!(!snap.state.contains(ThreadState::READY));
    assert_ne!(r.core.current_on(0), id);
}

#[test]
fn resume_inverts_suspend() {
    // P2: for each single blocking bit, resume(suspend(t, b), b) restores
    // the pre-suspend state.
    let r = rig(1);
    let (id, _tok, _) = r.oob_thread("subject", SchedParam::Fifo { prio: 10 });

    for bit in [ThreadState::SUSP, ThreadState::HALT, ThreadState::DELAY] {
        let before = r.core.thread_state(id).unwrap();
        r.core.suspend_thread(id, bit, Timeout::Infinite).unwrap();
        let blocked = r.core.thread_state(id).unwrap();
        assert!(blocked.contains(bit));
        assert!(!blocked.contains(ThreadState::READY));
        assert_ne!(r.core.current_on(0), id);

        r.core.resume_thread(id, bit).unwrap();
        let after = r.core.thread_state(id).unwrap();
        assert_eq!(before, after, "state not restored for {bit:?}");
        assert_eq!(r.core.current_on(0), id);
    }
}

#[test]
fn partial_resume_keeps_thread_blocked() {
    let r = rig(1);
    let (id, _tok, _) = r.oob_thread("subject", SchedParam::Fifo { prio: 10 });

    r.core.suspend_thread(id, ThreadState::SUSP, Timeout::Infinite).unwrap();
    r.core.suspend_thread(id, ThreadState::HALT, Timeout::Infinite).unwrap();
    r.core.resume_thread(id, ThreadState::SUSP).unwrap();

    let state = r.core.thread_state(id).unwrap();
    assert!(state.contains(ThreadState::HALT));
    assert!(!state.contains(ThreadState::READY));

    r.core.resume_thread(id, ThreadState::HALT).unwrap();
    assert!(r.core.thread_state(id).unwrap().contains(ThreadState::READY));
}

#[test]
fn timeout_and_break_are_distinguishable() {
    // P3: explicit unblock raises BREAK and leaves TIMEO clear; a natural
    // timer expiry does the opposite.
    let r = rig(1);
    let (a, _ta, _) = r.oob_thread("a", SchedParam::Fifo { prio: 10 });
    let (b, _tb, _) = r.oob_thread("b", SchedParam::Fifo { prio: 9 });

    r.core
        .suspend_thread(a, ThreadState::DELAY, Timeout::After(10 * MILLIS))
        .unwrap();
    assert_eq!(r.core.unblock(a), Ok(Some(Unblocked::Delay)));
    let snap = r.core.thread_snapshot(a).unwrap();
    assert!(snap.info.contains(ThreadInfo::BREAK));
    assert!(!snap.info.contains(ThreadInfo::TIMEO));

    r.core
        .suspend_thread(b, ThreadState::DELAY, Timeout::After(10 * MILLIS))
        .unwrap();
    r.clock.advance(20 * MILLIS);
    r.core.tick(0);
    let snap = r.core.thread_snapshot(b).unwrap();
    assert!(snap.info.contains(ThreadInfo::TIMEO));
    assert!(!snap.info.contains(ThreadInfo::BREAK));
    assert!(snap.state.contains(ThreadState::READY));
}

#[test]
fn start_is_idempotent() {
    // P5: a second start leaves the final state unchanged.
    let r = rig(1);
    let (id, _tok, _) = r.user_thread("once", SchedParam::Weak { prio: 3 });

    let after_first = r.core.thread_state(id).unwrap();
    r.core.start(id).unwrap();
    let after_second = r.core.thread_state(id).unwrap();
    assert_eq!(after_first, after_second);
}

#[test]
fn pending_kick_preempts_new_wait() {
    // A forced wakeup that was never consumed turns the next suspend into a
    // no-op that reports a broken wait.
    let r = rig(1);
    let (id, _tok, _) = r.oob_thread("kicked", SchedParam::Fifo { prio: 10 });

    r.core.kick(id).unwrap();
    assert!(r.core.thread_snapshot(id).unwrap().info.contains(ThreadInfo::KICKED));

    r.core.suspend_thread(id, ThreadState::SUSP, Timeout::Infinite).unwrap();
    let snap = r.core.thread_snapshot(id).unwrap();
    assert!(!snap.state.contains(ThreadState::SUSP), "suspend should be elided");
    assert!(snap.info.contains(ThreadInfo::BREAK));
}

#[test]
fn unblock_reports_what_it_cleared() {
    let r = rig(1);
    let (id, _tok, _) = r.oob_thread("sleeper", SchedParam::Fifo { prio: 10 });

    r.core.suspend_thread(id, ThreadState::DELAY, Timeout::Infinite).unwrap();
    assert_eq!(r.core.unblock(id), Ok(Some(Unblocked::Delay)));
    assert_eq!(r.core.unblock(id), Ok(None));
}

#[test]
fn suspend_rejects_foreign_masks() {
    let r = rig(1);
    let (id, _tok, _) = r.oob_thread("subject", SchedParam::Fifo { prio: 10 });

    assert_eq!(
        r.core.suspend_thread(id, ThreadState::INBAND, Timeout::Infinite),
        Err(Error::InvalidArgument)
    );
    assert_eq!(
        r.core.resume_thread(id, ThreadState::DORMANT),
        Err(Error::InvalidArgument)
    );
}
