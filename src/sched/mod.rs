//! The scheduling core.
//!
//! One [`SchedulerCore`] owns everything the dual-context design needs to
//! keep consistent: the per-CPU run queues, the thread registry, the wait
//! objects and the per-CPU timer queues. Every state-machine mutation in
//! this crate happens under the core's single scheduler lock, inside the
//! `with_core` critical-section helper; host callbacks collected during a
//! critical section are fired only after the lock is released, so the lock
//! is never held across a host call.
//!
//! The transition engine lives here: [`suspend`]/[`resume`] implement the
//! state machine, `resched` keeps each run queue's notion of the current
//! thread in line with the ready sets, and the forced-transition operations
//! (kick, demote, cancel, killall) compose the two.

pub mod switch;

use crate::clock::{Clock, Nanos, Timeout};
use crate::host::{HostOps, HostTaskId};
use crate::sync::SpinLock;
use crate::sync::atomic::AtomicUsize;
use crate::thread::policy::{CLASSES, SchedParam};
use crate::thread::{
    CpuSet, PeriodState, Tcb, ThreadAttrs, ThreadId, ThreadInfo, ThreadSnapshot, ThreadState,
    ThreadStats,
};
use crate::timer::{TimerAction, TimerQueue};
use crate::wait::{self, SynState};
use crate::work::{Work, WorkQueue};
use crate::{Error, debug, info};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;

/// A queue of threads ordered by weighted priority, FIFO within a tier.
///
/// Used both for per-CPU ready sets and for wait-channel waiter lists.
pub struct PrioQueue {
    tiers: BTreeMap<i32, VecDeque<ThreadId>>,
    len: usize,
}

impl PrioQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            tiers: BTreeMap::new(),
            len: 0,
        }
    }

    /// Number of queued threads.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no thread is queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Files `id` at the tail of its priority tier.
    pub fn push_tail(&mut self, prio: i32, id: ThreadId) {
        self.tiers.entry(prio).or_insert_with(VecDeque::new).push_back(id);
        self.len += 1;
    }

    /// Files `id` at the head of its priority tier.
    pub fn push_head(&mut self, prio: i32, id: ThreadId) {
        self.tiers.entry(prio).or_insert_with(VecDeque::new).push_front(id);
        self.len += 1;
    }

    /// Removes `id` from the tier it was filed under. Returns whether it was
    /// present.
    pub fn remove(&mut self, prio: i32, id: ThreadId) -> bool {
        if let Some(tier) = self.tiers.get_mut(&prio) {
            if let Some(pos) = tier.iter().position(|&t| t == id) {
                tier.remove(pos);
                if tier.is_empty() {
                    self.tiers.remove(&prio);
                }
                self.len -= 1;
                return true;
            }
        }
        false
    }

    /// Highest-priority head, without removing it.
    pub fn peek_highest(&self) -> Option<(i32, ThreadId)> {
        self.tiers
            .iter()
            .next_back()
            .map(|(&prio, tier)| (prio, *tier.front().unwrap()))
    }

    /// Pops the highest-priority head.
    pub fn pop_highest(&mut self) -> Option<(i32, ThreadId)> {
        let (&prio, _) = self.tiers.iter().next_back()?;
        let tier = self.tiers.get_mut(&prio).unwrap();
        let id = tier.pop_front().unwrap();
        if tier.is_empty() {
            self.tiers.remove(&prio);
        }
        self.len -= 1;
        Some((prio, id))
    }
}

impl Default for PrioQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-CPU ready queues, one per scheduling class that keeps one.
pub struct ClassQueues {
    pub(crate) fifo: PrioQueue,
    pub(crate) weak: PrioQueue,
}

impl ClassQueues {
    fn new() -> Self {
        Self {
            fifo: PrioQueue::new(),
            weak: PrioQueue::new(),
        }
    }
}

pub(crate) struct Rq {
    pub(crate) curr: ThreadId,
    pub(crate) root: ThreadId,
    pub(crate) queues: ClassQueues,
    pub(crate) timers: TimerQueue,
    pub(crate) quantum_key: Option<crate::timer::TimerKey>,
}

pub(crate) struct CoreInner {
    pub(crate) rqs: Vec<Rq>,
    pub(crate) threads: BTreeMap<ThreadId, Box<Tcb>>,
    pub(crate) syns: BTreeMap<crate::wait::SynId, SynState>,
}

/// Host actions collected under the scheduler lock, fired after unlock.
#[derive(Default)]
pub(crate) struct Deferred {
    pub(crate) works: Vec<Work>,
    pub(crate) exited: Vec<Option<HostTaskId>>,
    pub(crate) unlisted: usize,
}

impl Deferred {
    pub(crate) fn push(&mut self, work: Work) {
        self.works.push(work);
    }
}

/// Which blocking condition [`SchedulerCore::unblock`] cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unblocked {
    /// The thread was sleeping.
    Delay,
    /// The thread was pending on a wait channel.
    Pend,
}

/// Builder for a [`SchedulerCore`].
///
/// Configures the system-wide settings (CPU count, default round-robin
/// quantum) before the core and its per-CPU root threads are created.
pub struct CoreBuilder {
    nr_cpus: usize,
    default_quantum: Nanos,
}

impl CoreBuilder {
    /// Starts a configuration with one CPU and a 5ms round-robin quantum.
    pub fn new() -> Self {
        Self {
            nr_cpus: 1,
            default_quantum: 5 * crate::clock::MILLIS,
        }
    }

    /// Number of logical CPUs to manage, up to [`crate::MAX_CPU`].
    pub fn nr_cpus(mut self, nr_cpus: usize) -> Self {
        assert!(nr_cpus >= 1 && nr_cpus <= crate::MAX_CPU);
        self.nr_cpus = nr_cpus;
        self
    }

    /// Default quantum applied when a round-robin thread does not specify
    /// one.
    pub fn rr_quantum(mut self, quantum: Nanos) -> Self {
        self.default_quantum = quantum;
        self
    }

    /// Creates the core, its run queues and one root thread per CPU.
    pub fn build(self, clock: Box<dyn Clock>, host: Box<dyn HostOps>) -> SchedulerCore {
        let now = clock.now();
        let mut rqs = Vec::with_capacity(self.nr_cpus);
        let mut threads = BTreeMap::new();
        for cpu in 0..self.nr_cpus {
            let id = ThreadId::alloc();
            let root = Box::new(Tcb {
                id,
                name: alloc::format!("root/{cpu}"),
                state: ThreadState::ROOT | ThreadState::READY,
                info: ThreadInfo::empty(),
                bprio: crate::thread::policy::IDLE_PRIO,
                cprio: crate::thread::policy::IDLE_PRIO,
                wprio: crate::thread::policy::IDLE_PRIO,
                qprio: crate::thread::policy::IDLE_PRIO,
                class: &crate::thread::policy::IDLE_CLASS,
                param: SchedParam::Idle,
                cpu,
                last_inband_cpu: cpu,
                affinity: CpuSet::single(cpu),
                rtimer: None,
                ptimer: None,
                period: None,
                wchan: None,
                boosters: alloc::collections::BTreeSet::new(),
                host_task: None,
                refs: 1,
                enlisted: false,
                stats: ThreadStats::default(),
                run_since: Some(now),
                created_at: now,
            });
            threads.insert(id, root);
            rqs.push(Rq {
                curr: id,
                root: id,
                queues: ClassQueues::new(),
                timers: TimerQueue::new(cpu),
                quantum_key: None,
            });
        }
        info!("scheduling core online: {} cpu(s)", self.nr_cpus);
        SchedulerCore {
            inner: SpinLock::new(CoreInner {
                rqs,
                threads,
                syns: BTreeMap::new(),
            }),
            clock,
            host,
            work: WorkQueue::new(),
            nr_threads: AtomicUsize::new(0),
            default_quantum: self.default_quantum,
        }
    }
}

impl Default for CoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The dual-context scheduling core.
///
/// See the [module documentation](self) for the locking model. All
/// operations are keyed by [`ThreadId`]; operations a thread performs on
/// itself take a domain token instead (see [`switch`]), which makes calling
/// an oob-only operation from in-band context a compile-time error.
pub struct SchedulerCore {
    pub(crate) inner: SpinLock<CoreInner>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) host: Box<dyn HostOps>,
    pub(crate) work: WorkQueue,
    pub(crate) nr_threads: AtomicUsize,
    pub(crate) default_quantum: Nanos,
}

impl SchedulerCore {
    /// Runs `f` as one critical section under the scheduler lock; host
    /// callbacks requested by `f` fire after the lock is dropped.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut CoreInner, &mut Deferred) -> R) -> R {
        let mut post = Deferred::default();
        let mut guard = self.inner.lock();
        let r = f(&mut guard, &mut post);
        guard.unlock();
        let poke = !post.works.is_empty();
        for w in post.works {
            self.work.push(w);
        }
        if poke {
            self.host.notify_work();
        }
        if post.unlisted > 0 {
            self.nr_threads.fetch_sub(post.unlisted);
        }
        for task in post.exited {
            self.host.thread_exited(task);
        }
        r
    }

    /// Current reading of the core's clock.
    pub fn now(&self) -> Nanos {
        self.clock.now()
    }

    /// Number of live threads enlisted in the global registry.
    pub fn nr_threads(&self) -> usize {
        self.nr_threads.load()
    }

    /// Identifier of the thread currently selected on `cpu`.
    pub fn current_on(&self, cpu: usize) -> ThreadId {
        self.with_core(|c, _| c.rqs[cpu].curr)
    }

    /// Identifiers of every registered thread, root threads included.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.with_core(|c, _| c.threads.keys().copied().collect())
    }

    /// Earliest armed deadline on `cpu`'s timer queue, for hosts that
    /// program a one-shot tick instead of a periodic one.
    pub fn next_timer_deadline(&self, cpu: usize) -> Option<Nanos> {
        self.with_core(|c, _| c.rqs[cpu].timers.next_deadline())
    }

    /// Drains the deferred in-band work queue, dispatching each item to the
    /// host. Called by the host from its in-band run loop after a
    /// [`crate::host::HostOps::notify_work`] poke. Returns the number of
    /// items dispatched.
    pub fn drain_inband_work(&self) -> usize {
        let mut n = 0;
        while let Some(work) = self.work.pop() {
            match work {
                Work::WakeTask(task) => self.host.wake_task(task),
                Work::Mayday(task) => self.host.mayday(task),
                Work::Kill(task) => self.host.send_termination(task),
                Work::Resched(cpu) => self.host.resched(cpu),
            }
            n += 1;
        }
        n
    }

    // ---- lifecycle ----------------------------------------------------

    /// Fills in the core-wide default for round-robin parameters that leave
    /// the quantum unspecified.
    fn normalize_param(&self, param: SchedParam) -> SchedParam {
        match param {
            SchedParam::RoundRobin { prio, quantum: 0 } => SchedParam::RoundRobin {
                prio,
                quantum: self.default_quantum,
            },
            other => other,
        }
    }

    /// Registers a new dormant thread described by `attrs`.
    pub(crate) fn init_thread(&self, mut attrs: ThreadAttrs, user: bool) -> Result<ThreadId, Error> {
        let now = self.clock.now();
        attrs.param = self.normalize_param(attrs.param);
        self.with_core(|c, _| {
            let nr_cpus = c.rqs.len();
            let affinity = attrs.affinity.restrict(nr_cpus);
            if affinity.is_empty() {
                return Err(Error::InvalidArgument);
            }
            let cpu = match attrs.cpu {
                Some(cpu) => {
                    if !affinity.contains(cpu) {
                        return Err(Error::InvalidArgument);
                    }
                    cpu
                }
                None => affinity.first().unwrap(),
            };
            let class = attrs.param.class();
            class.check(&attrs.param)?;
            if let Some(quantum) = class.quantum(&attrs.param) {
                if quantum < self.clock.resolution() {
                    return Err(Error::InvalidArgument);
                }
            }
            let id = ThreadId::alloc();
            let prio = attrs.param.prio();
            let mut state = ThreadState::DORMANT | ThreadState::INBAND;
            if user {
                state.insert(ThreadState::USER);
            }
            if attrs.warn {
                state.insert(ThreadState::WARN);
            }
            if class.name() == "weak" {
                state.insert(ThreadState::WEAK);
            }
            if class.quantum(&attrs.param).is_some() {
                state.insert(ThreadState::RRB);
            }
            let enlisted = !user;
            let tcb = Box::new(Tcb {
                id,
                name: attrs.name,
                state,
                info: ThreadInfo::empty(),
                bprio: prio,
                cprio: prio,
                wprio: class.weighted_prio(prio),
                qprio: class.weighted_prio(prio),
                class,
                param: attrs.param,
                cpu,
                last_inband_cpu: cpu,
                affinity,
                rtimer: None,
                ptimer: None,
                period: None,
                wchan: None,
                boosters: alloc::collections::BTreeSet::new(),
                host_task: None,
                refs: 1,
                enlisted,
                stats: ThreadStats::default(),
                run_since: None,
                created_at: now,
            });
            debug!("thread {:?} ({}) created on cpu {}", id, tcb.name, cpu);
            c.threads.insert(id, tcb);
            Ok(id)
        })
        .inspect(|_| {
            if !user {
                self.nr_threads.fetch_add(1);
            }
        })
    }

    /// Binds the given host task to the thread, yielding the in-band domain
    /// token of the switch protocol.
    pub fn bind(&self, id: ThreadId, task: HostTaskId) -> Result<switch::InbandToken, Error> {
        self.with_core(|c, _| {
            let t = c.threads.get_mut(&id).ok_or(Error::Stale)?;
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::Stale);
            }
            if t.host_task.is_some() {
                return Err(Error::Busy);
            }
            t.host_task = Some(task);
            t.last_inband_cpu = t.cpu;
            Ok(switch::InbandToken::new(id))
        })
    }

    /// Maps a pre-existing in-band user task onto a new thread on demand.
    ///
    /// The user-space analog of [`crate::thread::KthreadBuilder`]: the
    /// thread is created dormant, bound to `task`, and left for the caller
    /// to [`SchedulerCore::start`] and switch oob.
    pub fn map_user_thread(
        &self,
        attrs: ThreadAttrs,
        task: HostTaskId,
    ) -> Result<(ThreadId, switch::InbandToken), Error> {
        let id = self.init_thread(attrs, true)?;
        let token = self.bind(id, task)?;
        Ok((id, token))
    }

    /// Starts a dormant thread; enlists user threads into the global
    /// registry. Starting an already-started thread reorders it to the head
    /// of its ready tier and is not an error.
    pub fn start(&self, id: ThreadId) -> Result<(), Error> {
        let now = self.clock.now();
        let mut enlist = false;
        self.with_core(|c, post| {
            let t = c.threads.get_mut(&id).ok_or(Error::Stale)?;
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::Stale);
            }
            if t.state.contains(ThreadState::USER)
                && t.state.contains(ThreadState::DORMANT)
                && !t.enlisted
            {
                t.enlisted = true;
                enlist = true;
            }
            resume(c, now, id, ThreadState::DORMANT, post);
            Ok(())
        })
        .inspect(|_| {
            if enlist {
                self.nr_threads.fetch_add(1);
            }
        })
    }

    /// Drops the owner reference on a thread; the control block is released
    /// once the thread has exited and no reference remains.
    pub fn detach(&self, id: ThreadId) -> Result<(), Error> {
        self.with_core(|c, _| {
            let t = c.threads.get_mut(&id).ok_or(Error::Stale)?;
            t.refs = t.refs.saturating_sub(1);
            if t.refs == 0 && t.state.contains(ThreadState::ZOMBIE) {
                c.threads.remove(&id);
            }
            Ok(())
        })
    }

    /// Blocks the calling in-band context until `id` has exited, then waits
    /// for a quiescence period so the joinee has fully vacated any borrowed
    /// context.
    ///
    /// Multiple joiners may wait on the same thread; all of them return
    /// successfully.
    pub fn join(&self, id: ThreadId, uninterruptible: bool) -> Result<(), Error> {
        loop {
            let done = self.with_core(|c, _| {
                let t = c.threads.get(&id).ok_or(Error::Stale)?;
                if t.state.contains(ThreadState::ROOT) {
                    return Err(Error::InvalidArgument);
                }
                Ok(t.state.contains(ThreadState::ZOMBIE))
            })?;
            if done {
                break;
            }
            match self.host.block_inband(uninterruptible) {
                Ok(()) => {}
                Err(e) => {
                    if !uninterruptible {
                        return Err(e);
                    }
                }
            }
        }
        self.host.quiescence();
        Ok(())
    }

    /// [`SchedulerCore::join`], with the caller identified by its in-band
    /// token so self-joins fail with [`Error::Deadlock`].
    pub fn join_from(
        &self,
        tok: &switch::InbandToken,
        id: ThreadId,
        uninterruptible: bool,
    ) -> Result<(), Error> {
        if tok.thread() == id {
            return Err(Error::Deadlock);
        }
        self.join(id, uninterruptible)
    }

    /// Finalizes the calling thread from the oob domain. The thread becomes
    /// a zombie; joiners are woken and the control block lingers until the
    /// last reference drops.
    pub fn exit(&self, tok: switch::OobToken) {
        let id = tok.into_thread();
        let now = self.clock.now();
        self.with_core(|c, post| finalize(c, now, id, post));
    }

    /// Finalizes the calling thread from the in-band domain (mapping
    /// failures, cancellation observed before the first oob switch).
    pub fn exit_inband(&self, tok: switch::InbandToken) {
        let id = tok.into_thread();
        let now = self.clock.now();
        self.with_core(|c, post| finalize(c, now, id, post));
    }

    // ---- state machine ------------------------------------------------

    /// Applies the given blocking bits to a thread, with an optional
    /// timeout. Only administrative bits may be requested here; `PEND` is
    /// entered through [`crate::wait`], `INBAND` through [`switch`].
    pub fn suspend_thread(
        &self,
        id: ThreadId,
        mask: ThreadState,
        timeout: Timeout,
    ) -> Result<(), Error> {
        const ALLOWED: ThreadState = ThreadState::from_bits_truncate(
            ThreadState::SUSP.bits() | ThreadState::DELAY.bits() | ThreadState::HALT.bits(),
        );
        if mask.is_empty() || !ALLOWED.contains(mask) {
            return Err(Error::InvalidArgument);
        }
        let now = self.clock.now();
        self.with_core(|c, post| {
            let t = c.threads.get(&id).ok_or(Error::Stale)?;
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::Stale);
            }
            suspend(c, now, id, mask, timeout, None, post);
            Ok(())
        })
    }

    /// Clears the given blocking bits from a thread, requeueing it when the
    /// last one goes.
    pub fn resume_thread(&self, id: ThreadId, mask: ThreadState) -> Result<(), Error> {
        const ALLOWED: ThreadState = ThreadState::from_bits_truncate(
            ThreadState::SUSP.bits()
                | ThreadState::DELAY.bits()
                | ThreadState::HALT.bits()
                | ThreadState::PEND.bits(),
        );
        if mask.is_empty() || !ALLOWED.contains(mask) {
            return Err(Error::InvalidArgument);
        }
        let now = self.clock.now();
        self.with_core(|c, post| {
            let t = c.threads.get(&id).ok_or(Error::Stale)?;
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::Stale);
            }
            resume(c, now, id, mask, post);
            Ok(())
        })
    }

    /// Administratively halts a thread.
    pub fn hold(&self, id: ThreadId) -> Result<(), Error> {
        self.suspend_thread(id, ThreadState::HALT, Timeout::Infinite)
    }

    /// Releases an administratively halted thread.
    pub fn unhalt(&self, id: ThreadId) -> Result<(), Error> {
        self.resume_thread(id, ThreadState::HALT)
    }

    /// Breaks a thread out of a sleep or a wait-channel pend, whichever it
    /// is in. The target observes [`ThreadInfo::BREAK`]: interrupted, no
    /// resource obtained. Reports which condition was cleared, or `None`
    /// when the thread was not blocked in either way.
    pub fn unblock(&self, id: ThreadId) -> Result<Option<Unblocked>, Error> {
        let now = self.clock.now();
        self.with_core(|c, post| {
            let t = c.threads.get(&id).ok_or(Error::Stale)?;
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::Stale);
            }
            Ok(unblock_locked(c, now, id, post))
        })
    }

    /// Forces a thread out of whatever blocking call it is in, or sends a
    /// running user thread the asynchronous trap that makes it re-enter the
    /// in-band domain.
    pub fn kick(&self, id: ThreadId) -> Result<(), Error> {
        let now = self.clock.now();
        self.with_core(|c, post| {
            let t = c.threads.get(&id).ok_or(Error::Stale)?;
            if t.state.contains(ThreadState::ROOT) {
                return Err(Error::InvalidArgument);
            }
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::Stale);
            }
            kick_locked(c, now, id, post);
            Ok(())
        })
    }

    /// Kicks a thread and demotes it to the weak class at priority 0,
    /// preventing it from re-acquiring oob CPU time without an explicit
    /// policy change.
    pub fn demote(&self, id: ThreadId) -> Result<(), Error> {
        let now = self.clock.now();
        self.with_core(|c, post| {
            let t = c.threads.get(&id).ok_or(Error::Stale)?;
            if t.state.contains(ThreadState::ROOT) {
                return Err(Error::InvalidArgument);
            }
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::Stale);
            }
            kick_locked(c, now, id, post);
            set_schedparam_locked(c, now, id, SchedParam::Weak { prio: 0 }, post)
        })
    }

    /// Requests cancellation of a thread. Idempotent; the first call marks
    /// the target and arranges for it to reach a cancellation point:
    /// dormant threads are finalized in place, user threads are demoted and
    /// sent a termination signal, kernel threads are kicked and must reach
    /// their next checkpoint voluntarily.
    pub fn cancel(&self, id: ThreadId) -> Result<(), Error> {
        let now = self.clock.now();
        self.with_core(|c, post| {
            let Some(t) = c.threads.get_mut(&id) else {
                return Err(Error::Stale);
            };
            if t.state.contains(ThreadState::ROOT) {
                return Err(Error::InvalidArgument);
            }
            if t.state.contains(ThreadState::ZOMBIE) || t.info.contains(ThreadInfo::CANCELD) {
                return Ok(());
            }
            t.info.insert(ThreadInfo::CANCELD);
            if t.state.contains(ThreadState::DORMANT) {
                // Never ran: fake the start-then-observe-cancellation
                // sequence by finalizing in place.
                finalize(c, now, id, post);
                return Ok(());
            }
            if t.state.contains(ThreadState::USER) {
                let task = t.host_task;
                kick_locked(c, now, id, post);
                set_schedparam_locked(c, now, id, SchedParam::Weak { prio: 0 }, post)?;
                if let Some(task) = task {
                    post.push(Work::Kill(task));
                }
            } else {
                kick_locked(c, now, id, post);
            }
            Ok(())
        })
    }

    /// Whether cancellation is pending on the given thread.
    pub fn cancel_pending(&self, id: ThreadId) -> bool {
        self.with_core(|c, _| {
            c.threads
                .get(&id)
                .map(|t| t.info.contains(ThreadInfo::CANCELD))
                .unwrap_or(true)
        })
    }

    /// Cancellation checkpoint for a thread running oob; kernel-thread entry
    /// loops poll this.
    pub fn should_stop(&self, tok: &switch::OobToken) -> bool {
        self.cancel_pending(tok.thread())
    }

    /// Cancels every non-root thread whose state intersects `mask` (an empty
    /// mask selects all), then blocks until they have exited and a full
    /// quiescence period has elapsed.
    pub fn killall(&self, mask: ThreadState) -> Result<(), Error> {
        let now = self.clock.now();
        let targets: Vec<ThreadId> = self.with_core(|c, post| {
            let ids: Vec<ThreadId> = c
                .threads
                .iter()
                .filter(|(_, t)| {
                    !t.state.contains(ThreadState::ROOT)
                        && !t.state.contains(ThreadState::ZOMBIE)
                        && (mask.is_empty() || t.state.intersects(mask))
                })
                .map(|(&id, _)| id)
                .collect();
            for &id in &ids {
                let t = c.threads.get_mut(&id).unwrap();
                if t.info.contains(ThreadInfo::CANCELD) {
                    continue;
                }
                t.info.insert(ThreadInfo::CANCELD);
                if t.state.contains(ThreadState::DORMANT) {
                    finalize(c, now, id, post);
                } else if c.threads.get(&id).unwrap().state.contains(ThreadState::USER) {
                    let task = c.threads.get(&id).unwrap().host_task;
                    kick_locked(c, now, id, post);
                    let _ = set_schedparam_locked(c, now, id, SchedParam::Weak { prio: 0 }, post);
                    if let Some(task) = task {
                        post.push(Work::Kill(task));
                    }
                } else {
                    kick_locked(c, now, id, post);
                }
            }
            ids
        });
        info!("killall: cancelled {} thread(s)", targets.len());
        loop {
            let remaining = self.with_core(|c, _| {
                targets
                    .iter()
                    .filter(|id| {
                        c.threads
                            .get(id)
                            .map(|t| !t.state.contains(ThreadState::ZOMBIE))
                            .unwrap_or(false)
                    })
                    .count()
            });
            if remaining == 0 {
                break;
            }
            self.host.block_inband(false)?;
        }
        self.host.quiescence();
        Ok(())
    }

    // ---- priority & policy --------------------------------------------

    /// Changes a thread's scheduling policy and parameters.
    pub fn set_schedparam(&self, id: ThreadId, param: SchedParam) -> Result<(), Error> {
        let param = self.normalize_param(param);
        let class = param.class();
        class.check(&param)?;
        if let Some(quantum) = class.quantum(&param) {
            if quantum < self.clock.resolution() {
                return Err(Error::InvalidArgument);
            }
        }
        let now = self.clock.now();
        self.with_core(|c, post| {
            let t = c.threads.get(&id).ok_or(Error::Stale)?;
            if t.state.contains(ThreadState::ROOT) {
                return Err(Error::InvalidArgument);
            }
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::Stale);
            }
            set_schedparam_locked(c, now, id, param, post)
        })
    }

    /// Restricts a thread to the given CPU set. The empty intersection with
    /// the managed CPUs is rejected. A thread currently running outside the
    /// new set is asked to come home; the run-queue fixup happens on its way
    /// through the in-band switch.
    pub fn set_affinity(&self, id: ThreadId, affinity: CpuSet) -> Result<(), Error> {
        let now = self.clock.now();
        self.with_core(|c, post| {
            let nr_cpus = c.rqs.len();
            let t = c.threads.get_mut(&id).ok_or(Error::Stale)?;
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::Stale);
            }
            let restricted = affinity.restrict(nr_cpus);
            if restricted.is_empty() {
                return Err(Error::InvalidArgument);
            }
            t.affinity = restricted;
            if restricted.contains(t.cpu) {
                return Ok(());
            }
            let target = restricted.first().unwrap();
            if c.rqs[t.cpu].curr == id {
                kick_locked(c, now, id, post);
                Ok(())
            } else {
                migrate_locked(c, now, id, target, post)
            }
        })
    }

    /// Moves a thread to another run queue. The thread must not be running;
    /// armed timers stay on the old CPU until they are next rearmed.
    pub fn migrate(&self, id: ThreadId, cpu: usize) -> Result<(), Error> {
        let now = self.clock.now();
        self.with_core(|c, post| {
            if cpu >= c.rqs.len() {
                return Err(Error::InvalidArgument);
            }
            let t = c.threads.get(&id).ok_or(Error::Stale)?;
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::Stale);
            }
            if !t.affinity.contains(cpu) {
                return Err(Error::InvalidArgument);
            }
            migrate_locked(c, now, id, cpu, post)
        })
    }

    /// Sets and clears observability mode bits on a thread. Only
    /// [`ThreadState::WARN`] may be changed this way; the previous state is
    /// returned.
    pub fn set_thread_mode(
        &self,
        id: ThreadId,
        set: ThreadState,
        clear: ThreadState,
    ) -> Result<ThreadState, Error> {
        const SETTABLE: ThreadState =
            ThreadState::from_bits_truncate(ThreadState::WARN.bits());
        if !SETTABLE.contains(set) || !SETTABLE.contains(clear) {
            return Err(Error::InvalidArgument);
        }
        self.with_core(|c, _| {
            let t = c.threads.get_mut(&id).ok_or(Error::Stale)?;
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::Stale);
            }
            let old = t.state;
            t.state.insert(set);
            t.state.remove(clear);
            Ok(old)
        })
    }

    // ---- timed waits & periodic activation ----------------------------

    /// Sleeps for `span` on the core's clock. Returns
    /// [`Error::Interrupted`] when woken early by something other than the
    /// timeout.
    pub fn sleep(&self, tok: &switch::OobToken, span: Nanos) -> Result<(), Error> {
        self.do_delay(tok.thread(), Timeout::After(span))
    }

    /// Sleeps until the given absolute deadline; [`Timeout::Infinite`] via
    /// [`SchedulerCore::sleep_forever`].
    pub fn sleep_until(&self, tok: &switch::OobToken, deadline: Nanos) -> Result<(), Error> {
        self.do_delay(tok.thread(), Timeout::At(deadline))
    }

    /// Sleeps until explicitly woken ([`SchedulerCore::unblock`], kick,
    /// cancellation).
    pub fn sleep_forever(&self, tok: &switch::OobToken) -> Result<(), Error> {
        self.do_delay(tok.thread(), Timeout::Infinite)
    }

    fn do_delay(&self, id: ThreadId, timeout: Timeout) -> Result<(), Error> {
        let now = self.clock.now();
        self.with_core(|c, post| {
            let t = c.threads.get_mut(&id).unwrap();
            t.stats.core_calls += 1;
            suspend(c, now, id, ThreadState::DELAY, timeout, None, post);
        });
        self.block_until_resumed(id);
        let info = self.take_info(id, ThreadInfo::BREAK | ThreadInfo::TIMEO);
        if info.contains(ThreadInfo::BREAK) {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    /// Arms periodic activation: first release at `idate` (or one period
    /// from now when `idate` is in the past), then every `period`. A zero
    /// `period` cancels periodic mode; a period below the clock resolution
    /// is rejected.
    pub fn set_period(
        &self,
        tok: &switch::OobToken,
        idate: Nanos,
        period: Nanos,
    ) -> Result<(), Error> {
        let id = tok.thread();
        let now = self.clock.now();
        self.with_core(|c, _| {
            let t = c.threads.get_mut(&id).unwrap();
            t.stats.core_calls += 1;
            if period == 0 {
                if let Some(key) = t.ptimer.take() {
                    c.rqs[key.cpu].timers.disarm(key);
                }
                t.period = None;
                return Ok(());
            }
            if period < self.clock.resolution() {
                return Err(Error::InvalidArgument);
            }
            let next = if idate <= now { now + period } else { idate };
            t.period = Some(PeriodState {
                interval: period,
                next,
            });
            Ok(())
        })
    }

    /// Waits for the next periodic activation armed by
    /// [`SchedulerCore::set_period`].
    ///
    /// Returns the number of activations that were missed before this call
    /// could run; missing periods is reported as a value, not an error, so
    /// the caller decides whether overruns are fatal. Returns
    /// [`Error::Again`] when no period is armed and
    /// [`Error::Interrupted`] when the wait was broken.
    pub fn wait_period(&self, tok: &switch::OobToken) -> Result<u64, Error> {
        let id = tok.thread();
        loop {
            let now = self.clock.now();
            let armed = self.with_core(|c, post| {
                let t = c.threads.get_mut(&id).unwrap();
                t.stats.core_calls += 1;
                let Some(period) = t.period.as_mut() else {
                    return Err(Error::Again);
                };
                if now >= period.next {
                    let overruns = (now - period.next) / period.interval;
                    period.next += (overruns + 1) * period.interval;
                    return Ok(Some(overruns));
                }
                let next = period.next;
                let key = c.rqs[t.cpu].timers.arm(next, TimerAction::Periodic(id));
                if let Some(old) = t.ptimer.replace(key) {
                    c.rqs[old.cpu].timers.disarm(old);
                }
                suspend(c, now, id, ThreadState::DELAY, Timeout::Infinite, None, post);
                Ok(None)
            })?;
            if let Some(overruns) = armed {
                return Ok(overruns);
            }
            self.block_until_resumed(id);
            let info = self.take_info(id, ThreadInfo::BREAK | ThreadInfo::TIMEO);
            if info.contains(ThreadInfo::BREAK) {
                return Err(Error::Interrupted);
            }
        }
    }

    /// Services the timer queue of `cpu`: fires every due timeout, periodic
    /// and round-robin deadline. Called by the host's periodic tick or
    /// whenever its timer hardware fires for this CPU.
    pub fn tick(&self, cpu: usize) {
        let now = self.clock.now();
        loop {
            let more = self.with_core(|c, post| {
                let Some((key, action)) = c.rqs[cpu].timers.pop_due(now) else {
                    return false;
                };
                match action {
                    TimerAction::Timeout(id) => {
                        if let Some(t) = c.threads.get_mut(&id) {
                            if t.rtimer == Some(key) {
                                t.rtimer = None;
                            }
                            if t.state.intersects(ThreadState::DELAY | ThreadState::PEND) {
                                t.info.insert(ThreadInfo::TIMEO);
                                resume(c, now, id, ThreadState::DELAY | ThreadState::PEND, post);
                            }
                        }
                    }
                    TimerAction::Periodic(id) => {
                        if let Some(t) = c.threads.get_mut(&id) {
                            if t.ptimer == Some(key) {
                                t.ptimer = None;
                            }
                            if t.state.contains(ThreadState::DELAY) {
                                resume(c, now, id, ThreadState::DELAY, post);
                            }
                        }
                    }
                    TimerAction::Quantum => {
                        if c.rqs[cpu].quantum_key == Some(key) {
                            c.rqs[cpu].quantum_key = None;
                            rotate(c, cpu, now, post);
                        }
                    }
                }
                true
            });
            if !more {
                break;
            }
        }
    }

    // ---- diagnostics --------------------------------------------------

    /// Persistent state bits of the given thread.
    pub fn thread_state(&self, id: ThreadId) -> Result<ThreadState, Error> {
        self.with_core(|c, _| c.threads.get(&id).map(|t| t.state).ok_or(Error::Stale))
    }

    /// Read-only diagnostic projection of the given thread.
    pub fn thread_snapshot(&self, id: ThreadId) -> Result<ThreadSnapshot, Error> {
        let now = self.clock.now();
        self.with_core(|c, _| {
            let t = c.threads.get(&id).ok_or(Error::Stale)?;
            let mut policy_detail = String::new();
            t.class.render(&t.param, &mut policy_detail);
            let elapsed = now.saturating_sub(t.created_at).max(1);
            let usage_permille =
                ((t.stats.oob_runtime.saturating_mul(1000)) / elapsed).min(1000) as u32;
            Ok(ThreadSnapshot {
                id: t.id,
                name: t.name.clone(),
                state: t.state,
                info: t.info,
                cpu: t.cpu,
                bprio: t.bprio,
                cprio: t.cprio,
                wprio: t.wprio,
                policy: t.class.name(),
                policy_detail,
                stats: t.stats.clone(),
                timeout: t.rtimer.map(|key| key.deadline().saturating_sub(now)),
                pid: t.host_task,
                usage_permille,
            })
        })
    }

    // ---- internal helpers ---------------------------------------------

    /// Parks the calling context until the thread sheds its last blocking
    /// bit.
    pub(crate) fn block_until_resumed(&self, id: ThreadId) {
        loop {
            let (blocked, task) = self.with_core(|c, _| {
                let t = c.threads.get(&id).expect("blocked thread vanished");
                (t.is_blocked(), t.host_task)
            });
            if !blocked {
                break;
            }
            let task = task.expect("blocking thread has no backing task");
            self.host.wait_for_resume(task);
        }
    }

    /// Drains the given one-shot info bits, returning the ones that were
    /// set.
    pub(crate) fn take_info(&self, id: ThreadId, bits: ThreadInfo) -> ThreadInfo {
        self.with_core(|c, _| {
            let t = c.threads.get_mut(&id).expect("thread vanished");
            let got = t.info & bits;
            t.info.remove(bits);
            got
        })
    }
}

// ---- transition engine -------------------------------------------------

/// Files a thread into its class's ready queue and marks it READY.
pub(crate) fn enqueue(c: &mut CoreInner, id: ThreadId, head: bool) {
    let CoreInner { threads, rqs, .. } = c;
    let t = threads.get_mut(&id).unwrap();
    debug_assert!(!t.state.contains(ThreadState::ROOT));
    t.state.insert(ThreadState::READY);
    t.qprio = t.wprio;
    let q = t
        .class
        .queue(&mut rqs[t.cpu].queues)
        .expect("idle-class threads are never enqueued");
    if head {
        q.push_head(t.qprio, id);
    } else {
        q.push_tail(t.qprio, id);
    }
}

/// Unfiles a thread from its ready queue (no-op on the current thread,
/// which is READY but not queued) and clears READY.
pub(crate) fn dequeue(c: &mut CoreInner, id: ThreadId) {
    let CoreInner { threads, rqs, .. } = c;
    let t = threads.get_mut(&id).unwrap();
    if !t.state.contains(ThreadState::READY) {
        return;
    }
    t.state.remove(ThreadState::READY);
    if let Some(q) = t.class.queue(&mut rqs[t.cpu].queues) {
        q.remove(t.qprio, id);
    }
}

fn peek_next(c: &mut CoreInner, cpu: usize) -> Option<(i32, ThreadId)> {
    let queues = &mut c.rqs[cpu].queues;
    for class in CLASSES.iter() {
        if let Some(q) = class.queue(queues) {
            if let Some(hit) = q.peek_highest() {
                return Some(hit);
            }
        }
    }
    None
}

fn pick_next(c: &mut CoreInner, cpu: usize) -> Option<(i32, ThreadId)> {
    let queues = &mut c.rqs[cpu].queues;
    for class in CLASSES.iter() {
        if let Some(hit) = class.pick(queues) {
            return Some(hit);
        }
    }
    None
}

fn rearm_quantum(c: &mut CoreInner, cpu: usize, now: Nanos) {
    if let Some(key) = c.rqs[cpu].quantum_key.take() {
        c.rqs[cpu].timers.disarm(key);
    }
    let currid = c.rqs[cpu].curr;
    let t = c.threads.get(&currid).unwrap();
    if !t.state.contains(ThreadState::RRB) || t.state.contains(ThreadState::ROOT) {
        return;
    }
    if let Some(quantum) = t.class.quantum(&t.param) {
        let key = c.rqs[cpu].timers.arm(now + quantum, TimerAction::Quantum);
        c.rqs[cpu].quantum_key = Some(key);
    }
}

/// Re-evaluates which thread should run on `cpu`. The current thread is
/// preempted only by a strictly higher weighted priority, preserving FIFO
/// order among equals; a preempted thread resumes first in its tier.
pub(crate) fn resched(c: &mut CoreInner, cpu: usize, now: Nanos, post: &mut Deferred) {
    let currid = c.rqs[cpu].curr;
    let rootid = c.rqs[cpu].root;
    let (curr_ready, curr_w) = {
        let t = c.threads.get(&currid).unwrap();
        (t.state.contains(ThreadState::READY), t.wprio)
    };
    let next = peek_next(c, cpu);
    let switch = match next {
        Some((w, _)) => !curr_ready || w > curr_w,
        None => !curr_ready,
    };
    if !switch {
        return;
    }
    let newid = match pick_next(c, cpu) {
        Some((_, id)) => id,
        None => rootid,
    };
    if newid == currid {
        return;
    }
    if curr_ready && currid != rootid {
        enqueue(c, currid, true);
    }
    {
        let t = c.threads.get_mut(&currid).unwrap();
        if let Some(since) = t.run_since.take() {
            if currid != rootid {
                t.stats.oob_runtime += now.saturating_sub(since);
            }
        }
    }
    {
        let t = c.threads.get_mut(&newid).unwrap();
        t.run_since = Some(now);
    }
    c.rqs[cpu].curr = newid;
    post.push(Work::Resched(cpu));
    rearm_quantum(c, cpu, now);
}

/// Round-robin quantum expiry: the current thread yields to the head of its
/// tier (or any higher one) and re-files at the tail.
fn rotate(c: &mut CoreInner, cpu: usize, now: Nanos, post: &mut Deferred) {
    let currid = c.rqs[cpu].curr;
    let rootid = c.rqs[cpu].root;
    let rotatable = {
        let t = c.threads.get(&currid).unwrap();
        currid != rootid
            && t.state.contains(ThreadState::RRB)
            && t.state.contains(ThreadState::READY)
    };
    if !rotatable {
        rearm_quantum(c, cpu, now);
        return;
    }
    let curr_w = c.threads.get(&currid).unwrap().wprio;
    match peek_next(c, cpu) {
        Some((w, _)) if w >= curr_w => {
            let (_, newid) = pick_next(c, cpu).unwrap();
            enqueue(c, currid, false);
            {
                let t = c.threads.get_mut(&currid).unwrap();
                if let Some(since) = t.run_since.take() {
                    t.stats.oob_runtime += now.saturating_sub(since);
                }
            }
            {
                let t = c.threads.get_mut(&newid).unwrap();
                t.run_since = Some(now);
            }
            c.rqs[cpu].curr = newid;
            post.push(Work::Resched(cpu));
            rearm_quantum(c, cpu, now);
        }
        _ => rearm_quantum(c, cpu, now),
    }
}

/// The suspend half of the transition engine.
///
/// Applies `mask` to the thread's blocking state, arming the timeout timer
/// when `timeout` is finite and recording the wait channel when supplied.
/// Panics on programming errors: suspending a root thread, or requesting a
/// conjunctive wait on two channels.
pub(crate) fn suspend(
    c: &mut CoreInner,
    now: Nanos,
    id: ThreadId,
    mask: ThreadState,
    timeout: Timeout,
    wchan: Option<crate::wait::SynId>,
    post: &mut Deferred,
) {
    let (oldstate, is_curr, cpu) = {
        let t = c.threads.get(&id).unwrap();
        assert!(
            !t.state.contains(ThreadState::ROOT),
            "attempt to suspend the root thread of cpu {}",
            t.cpu
        );
        (t.state, c.rqs[t.cpu].curr == id, t.cpu)
    };

    // A previously forced wakeup takes precedence over entering a new
    // non-domain-switch wait.
    {
        let t = c.threads.get_mut(&id).unwrap();
        if (oldstate & ThreadState::BLOCK_BITS).is_empty()
            && !mask.contains(ThreadState::INBAND)
            && t.info.contains(ThreadInfo::KICKED)
        {
            t.info.insert(ThreadInfo::BREAK);
            return;
        }
        if is_curr {
            t.info.remove(
                ThreadInfo::RMID
                    | ThreadInfo::TIMEO
                    | ThreadInfo::BREAK
                    | ThreadInfo::WAKEN
                    | ThreadInfo::ROBBED
                    | ThreadInfo::KICKED,
            );
        }
    }

    if let Some(deadline) = timeout.deadline(now) {
        let key = c.rqs[cpu].timers.arm(deadline, TimerAction::Timeout(id));
        let t = c.threads.get_mut(&id).unwrap();
        if let Some(old) = t.rtimer.replace(key) {
            c.rqs[old.cpu].timers.disarm(old);
        }
        c.threads.get_mut(&id).unwrap().state.insert(ThreadState::DELAY);
    }

    dequeue(c, id);

    {
        let t = c.threads.get_mut(&id).unwrap();
        t.state.insert(mask);
        if let Some(syn) = wchan {
            assert!(
                t.wchan.is_none(),
                "conjunctive wait: thread {:?} already pends on a wait channel",
                id
            );
            t.wchan = Some(syn);
        }
    }

    if is_curr {
        // For a domain switch this reschedule is the oob half of the
        // transfer; the in-band half runs in switch_to_inband once the lock
        // is dropped.
        resched(c, cpu, now, post);
    } else if oldstate.contains(ThreadState::INBAND)
        && mask.intersects(ThreadState::SUSP | ThreadState::DELAY | ThreadState::HALT)
    {
        // The oob scheduler cannot stop in-band execution; tell the thread
        // to come home so the condition takes effect there.
        let t = c.threads.get(&id).unwrap();
        if let Some(task) = t.host_task {
            if t.state.contains(ThreadState::USER) {
                post.push(Work::Mayday(task));
            } else {
                post.push(Work::WakeTask(task));
            }
        }
    }
}

/// The resume half of the transition engine.
///
/// Clears `mask` from the thread's blocking state; the thread is requeued
/// only when no blocking bit remains. Returns whether the thread is now
/// runnable.
pub(crate) fn resume(
    c: &mut CoreInner,
    now: Nanos,
    id: ThreadId,
    mask: ThreadState,
    post: &mut Deferred,
) -> bool {
    let (oldstate, cpu, is_curr) = {
        let t = c.threads.get(&id).unwrap();
        (t.state, t.cpu, c.rqs[t.cpu].curr == id)
    };
    if oldstate.contains(ThreadState::ROOT) || oldstate.contains(ThreadState::ZOMBIE) {
        return false;
    }

    if (oldstate & ThreadState::BLOCK_BITS).is_empty() {
        // Already runnable: reorder to the head of its tier.
        if !is_curr {
            dequeue(c, id);
            enqueue(c, id, true);
            resched(c, cpu, now, post);
        }
        return true;
    }

    {
        let t = c.threads.get_mut(&id).unwrap();
        t.state.remove(mask & ThreadState::BLOCK_BITS);
        if oldstate.contains(ThreadState::DELAY) && mask.contains(ThreadState::DELAY) {
            if let Some(key) = t.rtimer.take() {
                c.rqs[key.cpu].timers.disarm(key);
            }
        }
    }

    let still_blocked = c.threads.get(&id).unwrap().is_blocked();
    if still_blocked {
        return false;
    }

    wait::forget_waiter(c, id, now, post);
    enqueue(c, id, false);
    resched(c, cpu, now, post);
    true
}

pub(crate) fn unblock_locked(
    c: &mut CoreInner,
    now: Nanos,
    id: ThreadId,
    post: &mut Deferred,
) -> Option<Unblocked> {
    let state = c.threads.get(&id).unwrap().state;
    let which = if state.contains(ThreadState::DELAY) {
        resume(c, now, id, ThreadState::DELAY | ThreadState::PEND, post);
        Some(Unblocked::Delay)
    } else if state.contains(ThreadState::PEND) {
        resume(c, now, id, ThreadState::PEND, post);
        Some(Unblocked::Pend)
    } else {
        None
    };
    if which.is_some() {
        // Interrupted, no resource obtained.
        c.threads.get_mut(&id).unwrap().info.insert(ThreadInfo::BREAK);
    }
    which
}

pub(crate) fn kick_locked(c: &mut CoreInner, now: Nanos, id: ThreadId, post: &mut Deferred) {
    if unblock_locked(c, now, id, post).is_some() {
        c.threads.get_mut(&id).unwrap().info.insert(ThreadInfo::KICKED);
        return;
    }
    let (blocked, user, task, forced, cpu) = {
        let t = c.threads.get(&id).unwrap();
        (
            t.is_blocked(),
            t.state.contains(ThreadState::USER),
            t.host_task,
            t.class.force_grant(&t.param),
            t.cpu,
        )
    };
    if blocked {
        // Administratively stopped or already in-band; nothing to eject.
        return;
    }
    c.threads.get_mut(&id).unwrap().info.insert(ThreadInfo::KICKED);
    if user {
        if let Some(task) = task {
            post.push(Work::Mayday(task));
        }
    }
    if forced && c.rqs[cpu].curr != id {
        // The policy withholds CPU from this thread; grant it a slice so it
        // can reach the trap.
        dequeue(c, id);
        enqueue(c, id, true);
        resched(c, cpu, now, post);
    }
}

pub(crate) fn set_schedparam_locked(
    c: &mut CoreInner,
    now: Nanos,
    id: ThreadId,
    param: SchedParam,
    post: &mut Deferred,
) -> Result<(), Error> {
    let class = param.class();
    class.check(&param)?;

    let (old_wprio, boosted, is_curr, cpu) = {
        let t = c.threads.get(&id).unwrap();
        (
            t.wprio,
            t.state.contains(ThreadState::BOOST),
            c.rqs[t.cpu].curr == id,
            t.cpu,
        )
    };
    let new_cprio = if boosted {
        c.threads.get(&id).unwrap().cprio
    } else {
        param.prio()
    };
    let new_wprio = class.weighted_prio(new_cprio);
    // Never reposition on a no-op weighted-priority change; a spurious move
    // would perturb round-robin fairness.
    let requeue = new_wprio != old_wprio
        && c.threads.get(&id).unwrap().state.contains(ThreadState::READY)
        && !is_curr
        && !boosted;
    if requeue {
        dequeue(c, id);
    }

    {
        let t = c.threads.get_mut(&id).unwrap();
        t.param = param;
        t.class = class;
        t.bprio = param.prio();
        t.cprio = new_cprio;
        t.wprio = new_wprio;
        if class.name() == "weak" {
            t.state.insert(ThreadState::WEAK);
        } else {
            t.state.remove(ThreadState::WEAK);
        }
        if class.quantum(&param).is_some() {
            t.state.insert(ThreadState::RRB);
        } else {
            t.state.remove(ThreadState::RRB);
        }
    }

    if new_wprio != old_wprio {
        wait::requeue_waiter(c, id, now, post);
    }

    if requeue {
        // Fairness: the thread goes to the back of its new tier.
        enqueue(c, id, false);
    }

    {
        let t = c.threads.get_mut(&id).unwrap();
        t.info.insert(ThreadInfo::SCHEDP);
        if t.state.contains(ThreadState::INBAND) {
            // Propagation to the host scheduler must happen from the
            // thread's own in-band context.
            if let Some(task) = t.host_task {
                if t.state.contains(ThreadState::USER) {
                    post.push(Work::Mayday(task));
                } else {
                    post.push(Work::WakeTask(task));
                }
            }
        }
    }

    resched(c, cpu, now, post);
    Ok(())
}

pub(crate) fn migrate_locked(
    c: &mut CoreInner,
    now: Nanos,
    id: ThreadId,
    cpu: usize,
    post: &mut Deferred,
) -> Result<(), Error> {
    let (old_cpu, is_curr, was_ready) = {
        let t = c.threads.get(&id).unwrap();
        (
            t.cpu,
            c.rqs[t.cpu].curr == id,
            t.state.contains(ThreadState::READY),
        )
    };
    if is_curr {
        return Err(Error::Busy);
    }
    if old_cpu == cpu {
        return Ok(());
    }
    if was_ready {
        dequeue(c, id);
    }
    c.threads.get_mut(&id).unwrap().cpu = cpu;
    if was_ready {
        enqueue(c, id, false);
        resched(c, cpu, now, post);
    }
    // Armed timers keep ticking on the old CPU; they relocate on the next
    // (re)arm.
    Ok(())
}

/// Terminal transition: the thread becomes a zombie, its timers and wait
/// registrations are dropped, joiners are poked, and the control block is
/// removed once the last reference is gone.
pub(crate) fn finalize(c: &mut CoreInner, now: Nanos, id: ThreadId, post: &mut Deferred) {
    match c.threads.get(&id) {
        Some(t) if !t.state.contains(ThreadState::ZOMBIE) => {}
        _ => return,
    }
    {
        let CoreInner { threads, rqs, .. } = c;
        let t = threads.get_mut(&id).unwrap();
        if let Some(key) = t.rtimer.take() {
            rqs[key.cpu].timers.disarm(key);
        }
        if let Some(key) = t.ptimer.take() {
            rqs[key.cpu].timers.disarm(key);
        }
        t.period = None;
    }
    wait::forget_waiter(c, id, now, post);

    let (cpu, is_curr, enlisted, task, user) = {
        let t = c.threads.get(&id).unwrap();
        (
            t.cpu,
            c.rqs[t.cpu].curr == id,
            t.enlisted,
            t.host_task,
            t.state & ThreadState::USER,
        )
    };
    if !is_curr {
        dequeue(c, id);
    }
    {
        let t = c.threads.get_mut(&id).unwrap();
        t.state = ThreadState::ZOMBIE | user;
        t.enlisted = false;
        t.run_since = None;
    }
    if enlisted {
        post.unlisted += 1;
    }
    debug!("thread {:?} exited", id);
    if is_curr {
        resched(c, cpu, now, post);
    }
    post.exited.push(task);
    let t = c.threads.get(&id).unwrap();
    if t.refs == 0 {
        c.threads.remove(&id);
    }
}
