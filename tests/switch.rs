//! Cross-domain switch protocol and forced transitions.

mod common;

use common::rig;
use janus::Error;
use janus::clock::Timeout;
use janus::sched::switch::InbandCause;
use janus::thread::policy::SchedParam;
use janus::thread::{CpuSet, ThreadAttrs, ThreadInfo, ThreadState};

#[test]
fn switch_round_trip_returns_to_same_rq() {
    // Scenario: oob -> inband -> oob leaves the thread oob-ready on the run
    // queue it started from.
    let r = rig(2);
    let (id, otok, task) = r.oob_thread("pilgrim", SchedParam::Fifo { prio: 10 });
    let home = r.core.thread_snapshot(id).unwrap().cpu;

    let itok = r.core.switch_to_inband(otok, InbandCause::SysDemand);
    let snap = r.core.thread_snapshot(id).unwrap();
    assert!(snap.state.contains(ThreadState::INBAND));
    assert_ne!(r.core.current_on(home), id);

    // The deferred wake request reaches the host once in-band work drains.
    r.core.drain_inband_work();
    assert!(r.host.wakes.lock().unwrap().contains(&task));

    let otok = r.core.switch_to_oob(itok).ok().unwrap();
    let snap = r.core.thread_snapshot(id).unwrap();
    assert!(!snap.state.contains(ThreadState::INBAND));
    assert!(snap.state.contains(ThreadState::READY));
    assert_eq!(snap.cpu, home);
    assert_eq!(snap.stats.inband_switches, 1);
    assert_eq!(snap.stats.oob_switches, 2);
    drop(otok);
}

#[test]
fn pending_signal_blocks_oob_switch() {
    let r = rig(1);
    let (id, itok, task) = r.user_thread("signalled", SchedParam::Fifo { prio: 10 });

    r.host.raise_signal(task);
    let fail = r.core.switch_to_oob(itok).err().unwrap();
    assert_eq!(fail.error, Error::Interrupted);
    assert!(r.core.thread_state(id).unwrap().contains(ThreadState::INBAND));

    r.host.clear_signal(task);
    let _otok = r.core.switch_to_oob(fail.token).ok().unwrap();
    assert!(!r.core.thread_state(id).unwrap().contains(ThreadState::INBAND));
}

#[test]
fn refused_stage_transfer_is_retryable() {
    let r = rig(1);
    let (_id, itok, _) = r.user_thread("patient", SchedParam::Fifo { prio: 10 });

    r.host.refuse_oob.store(1, std::sync::atomic::Ordering::SeqCst);
    let fail = r.core.switch_to_oob(itok).err().unwrap();
    assert_eq!(fail.error, Error::Again);
    assert!(r.core.switch_to_oob(fail.token).is_ok());
}

#[test]
fn cancellation_racing_the_transfer_backs_out() {
    // The transfer race window: the condition arrives after the in-band checks
    // but is caught by the oob-side retest, which heads straight back.
    let r = rig(1);
    let (id, itok, _) = r.user_thread("racer", SchedParam::Fifo { prio: 10 });

    r.core.cancel(id).unwrap();
    let fail = r.core.switch_to_oob(itok).err().unwrap();
    assert_eq!(fail.error, Error::Interrupted);
    let snap = r.core.thread_snapshot(id).unwrap();
    assert!(snap.state.contains(ThreadState::INBAND));
    assert!(!snap.state.contains(ThreadState::READY));
}

#[test]
fn unstarted_thread_cannot_enter_oob() {
    let r = rig(1);
    let (_id, itok) = r
        .core
        .map_user_thread(ThreadAttrs::new("dormant"), r.task())
        .unwrap();
    let fail = r.core.switch_to_oob(itok).err().unwrap();
    assert_eq!(fail.error, Error::OperationNotPermitted);
}

#[test]
fn mode_switch_is_reported_when_armed() {
    let r = rig(1);
    let task = r.task();
    let (id, itok) = r
        .core
        .map_user_thread(
            ThreadAttrs::new("watched")
                .param(SchedParam::Fifo { prio: 8 })
                .warn_on_switch(true),
            task,
        )
        .unwrap();
    r.core.start(id).unwrap();
    let otok = r.core.switch_to_oob(itok).ok().unwrap();

    let itok = r.core.switch_to_inband(otok, InbandCause::Signal);
    assert_eq!(
        r.host.mode_switches.lock().unwrap().as_slice(),
        &[(task, InbandCause::Signal)]
    );

    // An undefined cause stays quiet.
    let otok = r.core.switch_to_oob(itok).ok().unwrap();
    let _itok = r.core.switch_to_inband(otok, InbandCause::Undefined);
    assert_eq!(r.host.mode_switches.lock().unwrap().len(), 1);
}

#[test]
fn schedparam_change_propagates_at_inband_switch() {
    let r = rig(1);
    let (id, otok, task) = r.oob_thread("shifting", SchedParam::Fifo { prio: 5 });

    r.core.set_schedparam(id, SchedParam::Fifo { prio: 7 }).unwrap();
    assert!(r.core.thread_snapshot(id).unwrap().info.contains(ThreadInfo::SCHEDP));

    let _itok = r.core.switch_to_inband(otok, InbandCause::Undefined);
    assert_eq!(r.host.inband_prios.lock().unwrap().as_slice(), &[(task, 7)]);
    assert!(!r.core.thread_snapshot(id).unwrap().info.contains(ThreadInfo::SCHEDP));
}

#[test]
fn kick_traps_a_running_user_thread() {
    let r = rig(1);
    let (id, _otok, task) = r.oob_thread("trapped", SchedParam::Fifo { prio: 10 });
    assert_eq!(r.core.current_on(0), id);

    r.core.kick(id).unwrap();
    r.core.drain_inband_work();
    assert!(r.host.maydays.lock().unwrap().contains(&task));
    assert!(r.core.thread_snapshot(id).unwrap().info.contains(ThreadInfo::KICKED));
}

#[test]
fn forced_suspend_of_inband_thread_requests_come_home() {
    // The oob scheduler cannot stop in-band execution, so a
    // remote suspension sends the come-home notification instead.
    let r = rig(1);
    let (id, _itok, task) = r.user_thread("homesick", SchedParam::Fifo { prio: 10 });

    r.core
        .suspend_thread(id, ThreadState::SUSP, Timeout::Infinite)
        .unwrap();
    let state = r.core.thread_state(id).unwrap();
    assert!(state.contains(ThreadState::SUSP));
    assert!(state.contains(ThreadState::INBAND));

    r.core.drain_inband_work();
    assert!(r.host.maydays.lock().unwrap().contains(&task));
}

#[test]
fn affinity_change_on_running_thread_repairs_lazily() {
    let r = rig(2);
    let (id, otok, task) = r.oob_thread("mover", SchedParam::Fifo { prio: 10 });
    assert_eq!(r.core.thread_snapshot(id).unwrap().cpu, 0);

    r.core.set_affinity(id, CpuSet::single(1)).unwrap();
    // Still on the old run queue until the thread comes home.
    assert_eq!(r.core.thread_snapshot(id).unwrap().cpu, 0);
    r.core.drain_inband_work();
    assert!(r.host.maydays.lock().unwrap().contains(&task));

    let _itok = r.core.switch_to_inband(otok, InbandCause::SysDemand);
    let snap = r.core.thread_snapshot(id).unwrap();
    assert_eq!(snap.cpu, 1);
    assert!(r.host.pins.lock().unwrap().contains(&(task, 1)));
}

#[test]
fn migrate_refuses_running_and_foreign_cpus() {
    let r = rig(2);
    let (id, _otok, _) = r.oob_thread("pinned", SchedParam::Fifo { prio: 10 });
    assert_eq!(r.core.migrate(id, 1), Err(Error::Busy));

    let (other, _tok2, _) = r.oob_thread("queued", SchedParam::Fifo { prio: 5 });
    assert_eq!(r.core.migrate(other, 7), Err(Error::InvalidArgument));
    r.core.migrate(other, 1).unwrap();
    assert_eq!(r.core.thread_snapshot(other).unwrap().cpu, 1);
    // Highest on its new queue: it becomes that CPU's current thread.
    assert_eq!(r.core.current_on(1), other);
}
