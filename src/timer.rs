//! Per-CPU timer queue.
//!
//! Each run queue owns one ordered queue of pending deadlines: thread
//! timeout timers, periodic-activation timers and the round-robin quantum
//! timer. Entries are keyed by `(deadline, sequence)` so equal deadlines
//! fire in arming order. The queue is only ever touched under the scheduler
//! lock; firing is driven by the host calling
//! [`crate::sched::SchedulerCore::tick`].
//!
//! A timer armed before its owner migrated keeps ticking on the old CPU's
//! queue; the relocation happens on the next (re)arm, which files the entry
//! on the owner's current CPU.

use crate::clock::Nanos;
use crate::thread::ThreadId;
use alloc::collections::BTreeMap;

/// What to do when a deadline is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerAction {
    /// A thread's timeout (resource) timer fired.
    Timeout(ThreadId),
    /// A thread's periodic-activation timer fired.
    Periodic(ThreadId),
    /// The running thread's round-robin quantum expired.
    Quantum,
}

/// Key of an armed timer; stored by the owner so it can disarm it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerKey {
    pub(crate) cpu: usize,
    deadline: Nanos,
    seq: u64,
}

impl TimerKey {
    /// Deadline the timer was armed for.
    pub(crate) fn deadline(&self) -> Nanos {
        self.deadline
    }
}

pub(crate) struct TimerQueue {
    cpu: usize,
    events: BTreeMap<(Nanos, u64), TimerAction>,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn new(cpu: usize) -> Self {
        Self {
            cpu,
            events: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Arm a timer for `deadline`; returns the key to disarm it with.
    pub(crate) fn arm(&mut self, deadline: Nanos, action: TimerAction) -> TimerKey {
        let seq = self.seq;
        self.seq += 1;
        self.events.insert((deadline, seq), action);
        TimerKey {
            cpu: self.cpu,
            deadline,
            seq,
        }
    }

    /// Disarm a previously armed timer. A timer that already fired is gone;
    /// disarming it again is a no-op.
    pub(crate) fn disarm(&mut self, key: TimerKey) {
        debug_assert_eq!(key.cpu, self.cpu);
        self.events.remove(&(key.deadline, key.seq));
    }

    /// Pop the next timer whose deadline is at or before `now`.
    pub(crate) fn pop_due(&mut self, now: Nanos) -> Option<(TimerKey, TimerAction)> {
        let (&(deadline, seq), _) = self.events.iter().next()?;
        if deadline > now {
            return None;
        }
        let action = self.events.remove(&(deadline, seq)).unwrap();
        Some((
            TimerKey {
                cpu: self.cpu,
                deadline,
                seq,
            },
            action,
        ))
    }

    /// Earliest armed deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<Nanos> {
        self.events.keys().next().map(|&(deadline, _)| deadline)
    }
}
