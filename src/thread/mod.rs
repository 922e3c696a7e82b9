//! Thread abstraction for the dual-context scheduling core.
//!
//! ## The state machine
//!
//! Every thread carries two bitsets with different lifetimes. The
//! [`ThreadState`] bits are the persistent state machine: they describe what
//! the thread *is* (dormant, ready, blocked on a wait channel, executing
//! in-band, ...) and are mutated only under the scheduler lock. The
//! [`ThreadInfo`] bits are one-shot conditions: they describe what just
//! *happened* to the thread (its timer fired, its wait was broken, it was
//! kicked) and are consumed by the next operation that cares. The two sets
//! are deliberately separate and must not be merged.
//!
//! A thread may be blocked for several reasons at once; it becomes runnable
//! only when the last bit of [`ThreadState::BLOCK_BITS`] clears. Exactly one
//! of those bits, [`ThreadState::INBAND`], tracks which of the two
//! cooperating schedulers currently has authority over the thread; see
//! [`crate::sched::switch`] for the only legal mutators of that bit.

pub mod policy;

use crate::clock::Nanos;
use crate::host::HostTaskId;
use crate::sync::atomic::AtomicU64;
use crate::timer::TimerKey;
use crate::wait::SynId;
use alloc::collections::BTreeSet;
use alloc::string::String;
use bitflags::bitflags;
use policy::{SchedClass, SchedParam};

bitflags! {
    /// Persistent thread state bits. Not mutually exclusive.
    pub struct ThreadState: u32 {
        /// Created but not started yet.
        const DORMANT = 1 << 0;
        /// Runnable under the oob scheduler (queued, or selected as the
        /// per-CPU current thread).
        const READY   = 1 << 1;
        /// Explicitly suspended.
        const SUSP    = 1 << 2;
        /// In a timed or infinite sleep.
        const DELAY   = 1 << 3;
        /// Blocked on a wait channel.
        const PEND    = 1 << 4;
        /// Administratively halted.
        const HALT    = 1 << 5;
        /// Currently under the in-band scheduler's authority.
        const INBAND  = 1 << 6;
        /// The per-CPU root (idle) thread.
        const ROOT    = 1 << 7;
        /// Exited; waiting to be joined and released.
        const ZOMBIE  = 1 << 8;
        /// Round-robin rotation enabled.
        const RRB     = 1 << 9;
        /// Priority currently inherited from a waiter.
        const BOOST   = 1 << 10;
        /// Backed by a user-space task.
        const USER    = 1 << 11;
        /// Observer wants mode-switch notifications.
        const WARN    = 1 << 12;
        /// Held by a debugger.
        const DEBUG   = 1 << 13;
        /// Member of the weak class.
        const WEAK    = 1 << 14;

        /// The bits that make a thread non-runnable. A thread is eligible
        /// for its run queue exactly when none of these is set.
        const BLOCK_BITS = Self::DORMANT.bits
            | Self::SUSP.bits
            | Self::DELAY.bits
            | Self::PEND.bits
            | Self::HALT.bits
            | Self::INBAND.bits;
    }
}

bitflags! {
    /// Transient, one-shot condition bits, drained by whoever observes them.
    pub struct ThreadInfo: u32 {
        /// A timed wait elapsed.
        const TIMEO   = 1 << 0;
        /// The wait channel was dismantled while the thread was pending.
        const RMID    = 1 << 1;
        /// A blocking call was interrupted; no resource was obtained.
        const BREAK   = 1 << 2;
        /// Forcibly ejected from a blocking call.
        const KICKED  = 1 << 3;
        /// Chosen by a targeted wakeup.
        const WAKEN   = 1 << 4;
        /// The awaited resource was granted, then snatched away before the
        /// thread ran.
        const ROBBED  = 1 << 5;
        /// Cancellation requested.
        const CANCELD = 1 << 6;
        /// A scheduling-parameter change awaits propagation in-band.
        const SCHEDP  = 1 << 7;
    }
}

/// Identifier of a thread inside a [`crate::sched::SchedulerCore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(u64);

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

impl ThreadId {
    pub(crate) fn alloc() -> ThreadId {
        ThreadId(NEXT_TID.fetch_add(1))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> ThreadId {
        ThreadId(raw)
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A set of CPUs a thread may run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSet(u64);

impl CpuSet {
    /// The empty set.
    pub const fn empty() -> CpuSet {
        CpuSet(0)
    }

    /// Every CPU the core could ever manage.
    pub const fn all() -> CpuSet {
        CpuSet(u64::MAX)
    }

    /// A set holding only `cpu`.
    pub const fn single(cpu: usize) -> CpuSet {
        CpuSet(1 << cpu)
    }

    /// Returns the set with `cpu` added.
    pub const fn with(self, cpu: usize) -> CpuSet {
        CpuSet(self.0 | (1 << cpu))
    }

    /// Whether `cpu` is a member.
    pub fn contains(self, cpu: usize) -> bool {
        cpu < 64 && self.0 & (1 << cpu) != 0
    }

    /// Intersection with another set.
    pub fn intersect(self, other: CpuSet) -> CpuSet {
        CpuSet(self.0 & other.0)
    }

    /// Whether no CPU is a member.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The lowest-numbered member, if any.
    pub fn first(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Restricts the set to the CPUs the core actually manages.
    pub(crate) fn restrict(self, nr_cpus: usize) -> CpuSet {
        let mask = if nr_cpus >= 64 { u64::MAX } else { (1u64 << nr_cpus) - 1 };
        CpuSet(self.0 & mask)
    }
}

/// Attributes describing a thread to be created.
pub struct ThreadAttrs {
    pub(crate) name: String,
    pub(crate) param: SchedParam,
    pub(crate) affinity: CpuSet,
    pub(crate) cpu: Option<usize>,
    pub(crate) warn: bool,
}

impl ThreadAttrs {
    /// Starts an attribute set for a thread called `name`, defaulting to the
    /// weak class at priority 0 and no affinity restriction.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        Self {
            name: String::from(name),
            param: SchedParam::Weak { prio: 0 },
            affinity: CpuSet::all(),
            cpu: None,
            warn: false,
        }
    }

    /// Scheduling policy and parameters.
    pub fn param(mut self, param: SchedParam) -> Self {
        self.param = param;
        self
    }

    /// Restricts the thread to the given CPU set.
    pub fn affinity(mut self, affinity: CpuSet) -> Self {
        self.affinity = affinity;
        self
    }

    /// Requests a specific home CPU (must be in the affinity set).
    pub fn cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Requests observer notifications on domain switches.
    pub fn warn_on_switch(mut self, warn: bool) -> Self {
        self.warn = warn;
        self
    }
}

/// Per-thread counters exposed through [`ThreadSnapshot`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ThreadStats {
    /// Number of oob-to-in-band switches.
    pub inband_switches: u64,
    /// Number of in-band-to-oob switches.
    pub oob_switches: u64,
    /// Number of core entry points invoked by the thread on itself.
    pub core_calls: u64,
    /// Accumulated oob execution time.
    pub oob_runtime: Nanos,
}

/// Read-only diagnostic projection of one thread.
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    /// Thread identifier.
    pub id: ThreadId,
    /// Thread name.
    pub name: String,
    /// Persistent state bits at the time of the snapshot.
    pub state: ThreadState,
    /// Pending one-shot condition bits at the time of the snapshot.
    pub info: ThreadInfo,
    /// Home CPU.
    pub cpu: usize,
    /// Base priority.
    pub bprio: i32,
    /// Current (possibly boosted) priority.
    pub cprio: i32,
    /// Weighted priority ordering the ready queues.
    pub wprio: i32,
    /// Policy class name.
    pub policy: &'static str,
    /// Policy-specific parameter rendering.
    pub policy_detail: String,
    /// Counters.
    pub stats: ThreadStats,
    /// Remaining time on the timeout timer, if armed.
    pub timeout: Option<Nanos>,
    /// Backing host task, if bound.
    pub pid: Option<HostTaskId>,
    /// Share of wall-clock time spent executing oob since creation, in
    /// permille.
    pub usage_permille: u32,
}

pub(crate) struct PeriodState {
    pub(crate) interval: Nanos,
    pub(crate) next: Nanos,
}

/// Thread control block. All fields are guarded by the scheduler lock.
pub(crate) struct Tcb {
    pub(crate) id: ThreadId,
    pub(crate) name: String,
    pub(crate) state: ThreadState,
    pub(crate) info: ThreadInfo,
    pub(crate) bprio: i32,
    pub(crate) cprio: i32,
    pub(crate) wprio: i32,
    /// The priority key this thread is filed under while sitting in a ready
    /// queue or a wait list.
    pub(crate) qprio: i32,
    pub(crate) class: &'static dyn SchedClass,
    pub(crate) param: SchedParam,
    pub(crate) cpu: usize,
    pub(crate) last_inband_cpu: usize,
    pub(crate) affinity: CpuSet,
    pub(crate) rtimer: Option<TimerKey>,
    pub(crate) ptimer: Option<TimerKey>,
    pub(crate) period: Option<PeriodState>,
    pub(crate) wchan: Option<SynId>,
    /// Wait objects currently lending priority to this thread.
    pub(crate) boosters: BTreeSet<SynId>,
    pub(crate) host_task: Option<HostTaskId>,
    pub(crate) refs: u32,
    pub(crate) enlisted: bool,
    pub(crate) stats: ThreadStats,
    pub(crate) run_since: Option<Nanos>,
    pub(crate) created_at: Nanos,
}

impl Tcb {
    pub(crate) fn is_blocked(&self) -> bool {
        !(self.state & ThreadState::BLOCK_BITS).is_empty()
    }
}

pub use kthread::{Kthread, KthreadBuilder};

mod kthread {
    use super::{SchedParam, ThreadAttrs, ThreadId};
    use crate::host::HostTaskId;
    use crate::sched::SchedulerCore;
    use crate::sched::switch::OobToken;
    use crate::thread::CpuSet;
    use crate::{Error, debug};
    use alloc::string::String;

    /// A builder for a kernel-backed thread.
    ///
    /// `prepare` registers the dormant thread with the core;
    /// [`Kthread::run`] is then invoked from the backing in-band task and
    /// carries the thread through mapping, its first oob switch, the entry
    /// function and exit.
    pub struct KthreadBuilder {
        attrs: ThreadAttrs,
    }

    impl KthreadBuilder {
        /// Creates a new builder for a kernel thread called `name`.
        pub fn new<I>(name: I) -> Self
        where
            String: From<I>,
        {
            Self {
                attrs: ThreadAttrs::new(name),
            }
        }

        /// Scheduling policy and parameters.
        pub fn param(mut self, param: SchedParam) -> Self {
            self.attrs = self.attrs.param(param);
            self
        }

        /// Restricts the thread to the given CPU set.
        pub fn affinity(mut self, affinity: CpuSet) -> Self {
            self.attrs = self.attrs.affinity(affinity);
            self
        }

        /// Requests a specific home CPU.
        pub fn cpu(mut self, cpu: usize) -> Self {
            self.attrs = self.attrs.cpu(cpu);
            self
        }

        /// Registers the thread with `core` in the dormant state.
        pub fn prepare(self, core: &SchedulerCore) -> Result<Kthread, Error> {
            let id = core.init_thread(self.attrs, false)?;
            Ok(Kthread { id })
        }
    }

    /// A kernel thread prepared on a core, awaiting its backing task.
    pub struct Kthread {
        id: ThreadId,
    }

    impl Kthread {
        /// The thread's identifier.
        pub fn id(&self) -> ThreadId {
            self.id
        }

        /// Maps the calling in-band task onto the thread and runs `f` in the
        /// oob domain.
        ///
        /// Performs the whole kernel-thread lifecycle: binds the task, starts
        /// the thread, switches oob, runs the entry function unless
        /// cancellation already arrived, and exits. Returns the error that
        /// aborted the mapping when the first oob switch could not be
        /// completed.
        pub fn run<F>(&self, core: &SchedulerCore, task: HostTaskId, f: F) -> Result<(), Error>
        where
            F: FnOnce(&SchedulerCore, &mut OobToken),
        {
            let mut itok = core.bind(self.id, task)?;
            core.start(self.id)?;
            loop {
                match core.switch_to_oob(itok) {
                    Ok(mut tok) => {
                        if !core.should_stop(&tok) {
                            f(core, &mut tok);
                        }
                        core.exit(tok);
                        return Ok(());
                    }
                    Err(fail) if fail.error == Error::Again => {
                        itok = fail.token;
                    }
                    Err(fail) => {
                        debug!("kthread {:?}: mapping aborted: {:?}", self.id, fail.error);
                        core.exit_inband(fail.token);
                        return Err(fail.error);
                    }
                }
            }
        }

        /// Drops the owner reference, releasing the control block once the
        /// thread has exited.
        pub fn release(self, core: &SchedulerCore) {
            let _ = core.detach(self.id);
        }
    }
}
