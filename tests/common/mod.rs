//! Shared test rig: a recording mock host and a manually driven clock.
//!
//! The rig plays the part of the host kernel: it logs every wake, mayday,
//! termination signal and pinning request the core asks for, and it lets a
//! test install a "pump" that runs whenever a blocked thread parks, so
//! single-threaded tests can drive timers and wakeups deterministically.

#![allow(dead_code)]

use janus::Error;
use janus::clock::{Clock, Nanos};
use janus::host::{HostOps, HostTaskId};
use janus::sched::switch::InbandCause;
use janus::sched::{CoreBuilder, SchedulerCore};
use janus::thread::policy::SchedParam;
use janus::thread::{ThreadAttrs, ThreadId};
use std::boxed::Box;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::vec::Vec;

/// Granularity the test clock reports: 1us.
pub const TEST_RESOLUTION: Nanos = 1_000;

pub struct TestClock(Arc<AtomicU64>);

impl Clock for TestClock {
    fn now(&self) -> Nanos {
        self.0.load(Ordering::SeqCst)
    }

    fn resolution(&self) -> Nanos {
        TEST_RESOLUTION
    }

    fn name(&self) -> &'static str {
        "test"
    }
}

#[derive(Clone)]
pub struct ClockHandle(Arc<AtomicU64>);

impl ClockHandle {
    pub fn advance(&self, span: Nanos) {
        self.0.fetch_add(span, Ordering::SeqCst);
    }

    pub fn now(&self) -> Nanos {
        self.0.load(Ordering::SeqCst)
    }
}

type Pump = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct HostLog {
    pub wakes: Mutex<Vec<HostTaskId>>,
    pub maydays: Mutex<Vec<HostTaskId>>,
    pub kills: Mutex<Vec<HostTaskId>>,
    pub pins: Mutex<Vec<(HostTaskId, usize)>>,
    pub inband_prios: Mutex<Vec<(HostTaskId, i32)>>,
    pub mode_switches: Mutex<Vec<(HostTaskId, InbandCause)>>,
    pub signals: Mutex<HashSet<u64>>,
    pub refuse_oob: AtomicUsize,
    pub interrupt_next_block: AtomicBool,
    pub quiescence_calls: AtomicUsize,
    pub exits: Mutex<Vec<Option<HostTaskId>>>,
    pump: Mutex<Option<Pump>>,
    parks: AtomicUsize,
}

impl HostLog {
    pub fn raise_signal(&self, task: HostTaskId) {
        self.signals.lock().unwrap().insert(task.0);
    }

    pub fn clear_signal(&self, task: HostTaskId) {
        self.signals.lock().unwrap().remove(&task.0);
    }

    fn park(&self) {
        if self.parks.fetch_add(1, Ordering::SeqCst) > 200_000 {
            panic!("test host: a blocked thread was never resumed");
        }
        let pump = self.pump.lock().unwrap();
        match pump.as_ref() {
            Some(pump) => pump(),
            None => std::thread::sleep(std::time::Duration::from_micros(200)),
        }
    }
}

#[derive(Clone)]
pub struct MockHost(pub Arc<HostLog>);

impl HostOps for MockHost {
    fn wake_task(&self, task: HostTaskId) {
        self.0.wakes.lock().unwrap().push(task);
    }

    fn mayday(&self, task: HostTaskId) {
        self.0.maydays.lock().unwrap().push(task);
    }

    fn send_termination(&self, task: HostTaskId) {
        self.0.kills.lock().unwrap().push(task);
    }

    fn signal_pending(&self, task: HostTaskId) -> bool {
        self.0.signals.lock().unwrap().contains(&task.0)
    }

    fn leave_inband(&self) -> Result<(), Error> {
        let left = self.0.refuse_oob.load(Ordering::SeqCst);
        if left > 0 {
            self.0.refuse_oob.store(left - 1, Ordering::SeqCst);
            return Err(Error::Again);
        }
        Ok(())
    }

    fn wait_for_resume(&self, _task: HostTaskId) {
        self.0.park();
    }

    fn block_inband(&self, uninterruptible: bool) -> Result<(), Error> {
        if !uninterruptible && self.0.interrupt_next_block.swap(false, Ordering::SeqCst) {
            return Err(Error::Interrupted);
        }
        self.0.park();
        Ok(())
    }

    fn quiescence(&self) {
        self.0.quiescence_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn pin_task(&self, task: HostTaskId, cpu: usize) {
        self.0.pins.lock().unwrap().push((task, cpu));
    }

    fn set_inband_schedparam(&self, task: HostTaskId, prio: i32) {
        self.0.inband_prios.lock().unwrap().push((task, prio));
    }

    fn notify_mode_switch(&self, task: HostTaskId, cause: InbandCause) {
        self.0.mode_switches.lock().unwrap().push((task, cause));
    }

    fn thread_exited(&self, task: Option<HostTaskId>) {
        self.0.exits.lock().unwrap().push(task);
    }
}

pub struct Rig {
    pub core: Arc<SchedulerCore>,
    pub clock: ClockHandle,
    pub host: Arc<HostLog>,
    next_task: AtomicU64,
}

impl Rig {
    /// Installs the closure run whenever a blocked thread parks.
    pub fn set_pump<F: Fn() + Send + Sync + 'static>(&self, pump: F) {
        *self.host.pump.lock().unwrap() = Some(Box::new(pump));
    }

    pub fn clear_pump(&self) {
        *self.host.pump.lock().unwrap() = None;
    }

    /// Allocates a fresh host task id (pid analog).
    pub fn task(&self) -> HostTaskId {
        HostTaskId(self.next_task.fetch_add(1, Ordering::SeqCst))
    }

    /// Maps, binds and starts a user thread, leaving it in-band.
    pub fn user_thread(
        &self,
        name: &str,
        param: SchedParam,
    ) -> (ThreadId, janus::sched::switch::InbandToken, HostTaskId) {
        let task = self.task();
        let (id, tok) = self
            .core
            .map_user_thread(ThreadAttrs::new(name).param(param), task)
            .expect("map_user_thread failed");
        self.core.start(id).expect("start failed");
        (id, tok, task)
    }

    /// Maps, binds, starts and switches a user thread oob.
    pub fn oob_thread(
        &self,
        name: &str,
        param: SchedParam,
    ) -> (ThreadId, janus::sched::switch::OobToken, HostTaskId) {
        let (id, tok, task) = self.user_thread(name, param);
        let tok = match self.core.switch_to_oob(tok) {
            Ok(tok) => tok,
            Err(fail) => panic!("switch_to_oob failed: {:?}", fail.error),
        };
        (id, tok, task)
    }
}

/// Spins until `cond` holds, panicking after a few seconds.
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..20_000 {
        if cond() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_micros(200));
    }
    panic!("timed out waiting for: {what}");
}

pub fn rig(nr_cpus: usize) -> Rig {
    let ticks = Arc::new(AtomicU64::new(1_000_000));
    let host = Arc::new(HostLog::default());
    let core = CoreBuilder::new()
        .nr_cpus(nr_cpus)
        .build(Box::new(TestClock(ticks.clone())), Box::new(MockHost(host.clone())));
    Rig {
        core: Arc::new(core),
        clock: ClockHandle(ticks),
        host,
        next_task: AtomicU64::new(100),
    }
}
