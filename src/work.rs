//! Deferred in-band work.
//!
//! Several state-machine transitions must trigger host actions that can only
//! run at a safe point in the in-band domain (waking a task, delivering a
//! mayday trap or a termination signal). The core pushes those requests onto
//! a lock-free queue, pokes the host once per batch through
//! [`crate::host::HostOps::notify_work`], and the host drains the queue from
//! its in-band run loop via
//! [`crate::sched::SchedulerCore::drain_inband_work`].

use crate::host::HostTaskId;
use crossbeam_queue::SegQueue;

/// A single deferred request for the in-band domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    /// Wake the given in-band task in the host scheduler.
    WakeTask(HostTaskId),
    /// Deliver a mayday trap to the given user task.
    Mayday(HostTaskId),
    /// Deliver a termination signal to the given task.
    Kill(HostTaskId),
    /// Re-run the oob scheduling decision on the given CPU.
    Resched(usize),
}

pub(crate) struct WorkQueue {
    q: SegQueue<Work>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self { q: SegQueue::new() }
    }

    pub(crate) fn push(&self, work: Work) {
        self.q.push(work);
    }

    pub(crate) fn pop(&self) -> Option<Work> {
        self.q.pop()
    }
}
