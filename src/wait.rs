//! Wait channels.
//!
//! A `Syn` is the abstract waitable object of the design: a priority-ordered
//! list of pending threads, optionally with priority inheritance toward a
//! designated owner. The synchronization primitives built on top (mutexes,
//! semaphores, events) live outside this core; here the scheduler only
//! manages waiter enqueue/dequeue, the three-way wakeup disambiguation
//! (granted / timed out / broken) and the owner boost.
//!
//! Boost contract: the owner's current priority is raised so its weighted
//! priority matches the highest head waiter across every channel boosting
//! it; the base priority is restored exactly when the last boosting relation
//! is released. Boosts do not propagate transitively across chains of
//! owners.

use crate::clock::Nanos;
use crate::sched::{
    CoreInner, Deferred, PrioQueue, SchedulerCore, dequeue, enqueue, resched, resume, suspend,
    switch::OobToken,
};
use crate::sync::atomic::AtomicU64;
use crate::thread::{ThreadId, ThreadInfo, ThreadState};
use crate::{Error, clock::Timeout};
use alloc::vec::Vec;

/// Identifier of a wait channel registered in a
/// [`crate::sched::SchedulerCore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SynId(u64);

static NEXT_SYN: AtomicU64 = AtomicU64::new(1);

pub(crate) struct SynState {
    pub(crate) pi: bool,
    pub(crate) owner: Option<ThreadId>,
    pub(crate) waiters: PrioQueue,
}

impl SchedulerCore {
    /// Registers a new wait channel. When `pi` is set, the channel boosts
    /// its owner to the priority of its highest waiter.
    pub fn new_syn(&self, pi: bool) -> SynId {
        let id = SynId(NEXT_SYN.fetch_add(1));
        self.with_core(|c, _| {
            c.syns.insert(
                id,
                SynState {
                    pi,
                    owner: None,
                    waiters: PrioQueue::new(),
                },
            );
        });
        id
    }

    /// Dismantles a wait channel. Every pending thread is flushed with
    /// [`ThreadInfo::RMID`]; its wait returns [`Error::Stale`].
    pub fn destroy_syn(&self, syn: SynId) -> Result<(), Error> {
        let now = self.clock.now();
        self.with_core(|c, post| {
            let Some(mut s) = c.syns.remove(&syn) else {
                return Err(Error::Stale);
            };
            let owner = s.owner;
            if let Some(owner) = owner {
                if let Some(t) = c.threads.get_mut(&owner) {
                    t.boosters.remove(&syn);
                }
            }
            while let Some((_, id)) = s.waiters.pop_highest() {
                let t = c.threads.get_mut(&id).unwrap();
                t.info.insert(ThreadInfo::RMID);
                t.wchan = None;
                resume(
                    c,
                    now,
                    id,
                    ThreadState::PEND | ThreadState::DELAY,
                    post,
                );
            }
            if let Some(owner) = owner {
                recompute_boost(c, owner, now, post);
            }
            Ok(())
        })
    }

    /// Declares which thread currently owns the resource guarded by the
    /// channel; `None` clears ownership. Boosting follows the owner.
    pub fn syn_set_owner(&self, syn: SynId, owner: Option<ThreadId>) -> Result<(), Error> {
        let now = self.clock.now();
        self.with_core(|c, post| {
            let s = c.syns.get_mut(&syn).ok_or(Error::Stale)?;
            if let Some(owner) = owner {
                if !c.threads.contains_key(&owner) {
                    return Err(Error::InvalidArgument);
                }
            }
            let pi = s.pi;
            let old = s.owner;
            let has_waiters = !s.waiters.is_empty();
            s.owner = owner;
            if pi {
                if let Some(old) = old {
                    if let Some(t) = c.threads.get_mut(&old) {
                        t.boosters.remove(&syn);
                    }
                    recompute_boost(c, old, now, post);
                }
                if let Some(new) = owner {
                    if has_waiters {
                        c.threads.get_mut(&new).unwrap().boosters.insert(syn);
                    }
                    recompute_boost(c, new, now, post);
                }
            }
            Ok(())
        })
    }

    /// Number of threads pending on the channel.
    pub fn syn_waiter_count(&self, syn: SynId) -> Result<usize, Error> {
        self.with_core(|c, _| c.syns.get(&syn).map(|s| s.waiters.len()).ok_or(Error::Stale))
    }

    /// Blocks the calling thread on the channel until a wakeup grants it the
    /// resource, distinguishing the three wakeup flavors: `Ok` means
    /// granted; [`Error::TimedOut`] means the timeout elapsed first;
    /// [`Error::Interrupted`] means the wait was broken with nothing
    /// granted. A waiter whose grant was snatched away re-pends against the
    /// same deadline.
    pub fn pend_on(&self, tok: &OobToken, syn: SynId, timeout: Timeout) -> Result<(), Error> {
        let id = tok.thread();
        let deadline = timeout.deadline(self.clock.now());
        loop {
            let now = self.clock.now();
            if let Some(d) = deadline {
                if now >= d {
                    return Err(Error::TimedOut);
                }
            }
            let bound = match deadline {
                Some(d) => Timeout::At(d),
                None => Timeout::Infinite,
            };
            self.with_core(|c, post| {
                if !c.syns.contains_key(&syn) {
                    return Err(Error::Stale);
                }
                let (pi, owner) = {
                    let s = c.syns.get(&syn).unwrap();
                    (s.pi, s.owner)
                };
                let wprio = {
                    let t = c.threads.get_mut(&id).unwrap();
                    t.stats.core_calls += 1;
                    // A pending forced wakeup elides the wait entirely; do
                    // not register on the channel.
                    if !t.is_blocked() && t.info.contains(ThreadInfo::KICKED) {
                        t.info.insert(ThreadInfo::BREAK);
                        return Ok(());
                    }
                    t.qprio = t.wprio;
                    t.wprio
                };
                c.syns.get_mut(&syn).unwrap().waiters.push_tail(wprio, id);
                if pi {
                    if let Some(owner) = owner {
                        if owner != id {
                            c.threads.get_mut(&owner).unwrap().boosters.insert(syn);
                            recompute_boost(c, owner, now, post);
                        }
                    }
                }
                suspend(c, now, id, ThreadState::PEND, bound, Some(syn), post);
                Ok(())
            })?;
            self.block_until_resumed(id);
            let info = self.take_info(
                id,
                ThreadInfo::TIMEO
                    | ThreadInfo::BREAK
                    | ThreadInfo::RMID
                    | ThreadInfo::WAKEN
                    | ThreadInfo::ROBBED,
            );
            if info.contains(ThreadInfo::RMID) {
                return Err(Error::Stale);
            }
            if info.contains(ThreadInfo::TIMEO) {
                return Err(Error::TimedOut);
            }
            if info.contains(ThreadInfo::BREAK) {
                return Err(Error::Interrupted);
            }
            if info.contains(ThreadInfo::ROBBED) {
                continue;
            }
            return Ok(());
        }
    }

    /// Wakes the highest-priority waiter, marking it as the grant target.
    /// Returns the woken thread, or `None` when nobody was pending.
    pub fn wake_one(&self, syn: SynId) -> Result<Option<ThreadId>, Error> {
        let now = self.clock.now();
        self.with_core(|c, post| {
            let s = c.syns.get(&syn).ok_or(Error::Stale)?;
            let Some((_, id)) = s.waiters.peek_highest() else {
                return Ok(None);
            };
            c.threads.get_mut(&id).unwrap().info.insert(ThreadInfo::WAKEN);
            resume(c, now, id, ThreadState::PEND | ThreadState::DELAY, post);
            Ok(Some(id))
        })
    }

    /// Wakes every waiter; returns how many were woken.
    pub fn wake_all(&self, syn: SynId) -> Result<usize, Error> {
        let now = self.clock.now();
        self.with_core(|c, post| {
            if !c.syns.contains_key(&syn) {
                return Err(Error::Stale);
            }
            let mut n = 0;
            loop {
                let Some((_, id)) = c.syns.get(&syn).unwrap().waiters.peek_highest() else {
                    break;
                };
                c.threads.get_mut(&id).unwrap().info.insert(ThreadInfo::WAKEN);
                resume(c, now, id, ThreadState::PEND | ThreadState::DELAY, post);
                n += 1;
            }
            Ok(n)
        })
    }

    /// Records that the resource granted to `id` by a targeted wakeup was
    /// snatched away before it could run; the waiter re-enters its pend
    /// loop instead of reporting a spurious grant.
    pub fn rob_waiter(&self, id: ThreadId) -> Result<(), Error> {
        self.with_core(|c, _| {
            let t = c.threads.get_mut(&id).ok_or(Error::Stale)?;
            t.info.remove(ThreadInfo::WAKEN);
            t.info.insert(ThreadInfo::ROBBED);
            Ok(())
        })
    }
}

/// Drops a thread's wait-channel registration, fixing up the owner's boost.
/// Called once the thread sheds its last blocking bit, and on exit.
pub(crate) fn forget_waiter(c: &mut CoreInner, id: ThreadId, now: Nanos, post: &mut Deferred) {
    let Some(syn) = c.threads.get_mut(&id).unwrap().wchan.take() else {
        return;
    };
    let qprio = c.threads.get(&id).unwrap().qprio;
    let mut owner = None;
    if let Some(s) = c.syns.get_mut(&syn) {
        s.waiters.remove(qprio, id);
        if s.pi {
            owner = s.owner;
            if s.waiters.is_empty() {
                if let Some(o) = s.owner {
                    if let Some(t) = c.threads.get_mut(&o) {
                        t.boosters.remove(&syn);
                    }
                }
            }
        }
    }
    if let Some(o) = owner {
        if o != id {
            recompute_boost(c, o, now, post);
        }
    }
}

/// Repositions a thread in its wait channel after a weighted-priority
/// change, and refreshes the boost it lends.
pub(crate) fn requeue_waiter(c: &mut CoreInner, id: ThreadId, now: Nanos, post: &mut Deferred) {
    let Some(syn) = c.threads.get(&id).unwrap().wchan else {
        return;
    };
    let (old_q, new_w) = {
        let t = c.threads.get(&id).unwrap();
        (t.qprio, t.wprio)
    };
    if old_q == new_w {
        return;
    }
    let mut owner = None;
    if let Some(s) = c.syns.get_mut(&syn) {
        if s.waiters.remove(old_q, id) {
            s.waiters.push_tail(new_w, id);
        }
        if s.pi {
            owner = s.owner;
        }
    }
    c.threads.get_mut(&id).unwrap().qprio = new_w;
    if let Some(o) = owner {
        if o != id {
            recompute_boost(c, o, now, post);
        }
    }
}

/// Recomputes the boost on `owner` from every channel still lending it
/// priority: highest head waiter wins, base priority returns when the last
/// relation goes.
pub(crate) fn recompute_boost(c: &mut CoreInner, owner: ThreadId, now: Nanos, post: &mut Deferred) {
    let Some(t) = c.threads.get(&owner) else {
        return;
    };
    if t.state.contains(ThreadState::ZOMBIE) {
        return;
    }
    let boosters: Vec<SynId> = t.boosters.iter().copied().collect();
    let mut ceiling: Option<i32> = None;
    let mut stale: Vec<SynId> = Vec::new();
    for syn in boosters {
        match c.syns.get(&syn) {
            Some(s) if s.owner == Some(owner) && !s.waiters.is_empty() => {
                let (w, _) = s.waiters.peek_highest().unwrap();
                ceiling = Some(ceiling.map_or(w, |top| top.max(w)));
            }
            _ => stale.push(syn),
        }
    }
    {
        let t = c.threads.get_mut(&owner).unwrap();
        for syn in stale {
            t.boosters.remove(&syn);
        }
    }

    let (old_w, base_w, weight, bprio, cpu, is_curr, was_ready) = {
        let t = c.threads.get(&owner).unwrap();
        (
            t.wprio,
            t.class.weighted_prio(t.bprio),
            t.class.weight(),
            t.bprio,
            t.cpu,
            c.rqs[t.cpu].curr == owner,
            t.state.contains(ThreadState::READY),
        )
    };
    let (cprio, boosted) = match ceiling {
        Some(top) if top > base_w => (top - weight, true),
        _ => (bprio, false),
    };
    {
        let t = c.threads.get_mut(&owner).unwrap();
        t.cprio = cprio;
        if boosted {
            t.state.insert(ThreadState::BOOST);
        } else {
            t.state.remove(ThreadState::BOOST);
        }
        t.wprio = t.class.weighted_prio(cprio);
    }
    let new_w = c.threads.get(&owner).unwrap().wprio;
    if new_w == old_w {
        return;
    }
    if was_ready && !is_curr {
        dequeue(c, owner);
        enqueue(c, owner, false);
    }
    resched(c, cpu, now, post);
}

/// Restores the base priority of a thread whose boosting relations have all
/// gone while it was away in-band.
pub(crate) fn drop_stale_boost(c: &mut CoreInner, id: ThreadId, now: Nanos, post: &mut Deferred) {
    let Some(t) = c.threads.get(&id) else {
        return;
    };
    if t.state.contains(ThreadState::BOOST) && t.boosters.is_empty() {
        recompute_boost(c, id, now, post);
    }
}
