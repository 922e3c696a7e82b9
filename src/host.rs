//! Host kernel collaborator seam.
//!
//! The core keeps the scheduling books; the host performs the mechanical
//! work: waking tasks, transferring execution between domains, delivering
//! signals. Everything the core ever asks of the host goes through
//! [`HostOps`]. Most methods have no-op defaults so a host (or a test
//! harness) implements only what it observes.

use crate::Error;
use crate::sched::switch::InbandCause;

/// Identifier of the in-band task backing a thread, as assigned by the host
/// kernel (a pid analog).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostTaskId(pub u64);

/// Operations the host kernel provides to the scheduling core.
///
/// Calls arrive from two kinds of places: deferred work drained by the
/// host's own in-band loop (see [`crate::work`]), and direct calls made by a
/// thread on itself during a domain switch. The core never invokes any of
/// these while holding its scheduler lock.
pub trait HostOps: Send + Sync {
    /// Deferred work is pending; poke the in-band side so it calls
    /// [`crate::sched::SchedulerCore::drain_inband_work`] at its next safe
    /// point.
    fn notify_work(&self) {}

    /// Wake the given in-band task in the host scheduler.
    fn wake_task(&self, task: HostTaskId);

    /// Deliver a mayday trap: force the given user task to re-enter the oob
    /// domain (and from there, `switch_to_inband`) at its earliest
    /// opportunity.
    fn mayday(&self, task: HostTaskId) {
        let _ = task;
    }

    /// Deliver a termination signal to the given task.
    fn send_termination(&self, task: HostTaskId) {
        let _ = task;
    }

    /// Whether the given task has a signal pending in-band.
    fn signal_pending(&self, task: HostTaskId) -> bool {
        let _ = task;
        false
    }

    /// Transfer the calling execution context from the in-band stage to the
    /// oob stage. May refuse (host work pending), in which case the caller
    /// backs out and retries.
    fn leave_inband(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Park the calling execution context until the core resumes the given
    /// thread's backing task. Returns when the thread may run again; the
    /// caller re-checks its blocking state.
    fn wait_for_resume(&self, task: HostTaskId);

    /// Block the calling in-band context until poked (joiner wait). Returns
    /// [`Error::Interrupted`] when a signal arrives and `uninterruptible` is
    /// false.
    fn block_inband(&self, uninterruptible: bool) -> Result<(), Error> {
        let _ = uninterruptible;
        Ok(())
    }

    /// Wait for a full quiescence period: every concurrent executor that
    /// could still reference a just-dismantled thread has finished.
    fn quiescence(&self) {}

    /// Ask the given CPU to re-run its oob scheduling decision (IPI analog).
    fn resched(&self, cpu: usize) {
        let _ = cpu;
    }

    /// Pin the given task onto the given CPU in the host scheduler.
    fn pin_task(&self, task: HostTaskId, cpu: usize) {
        let _ = (task, cpu);
    }

    /// Mirror an oob priority change into the host scheduler's view of the
    /// task (approximate mapping).
    fn set_inband_schedparam(&self, task: HostTaskId, prio: i32) {
        let _ = (task, prio);
    }

    /// Observer notification for a domain switch of a task that asked for
    /// mode-switch warnings.
    fn notify_mode_switch(&self, task: HostTaskId, cause: InbandCause) {
        let _ = (task, cause);
    }

    /// A thread has exited; joiners blocked in [`HostOps::block_inband`]
    /// should be poked.
    fn thread_exited(&self, task: Option<HostTaskId>) {
        let _ = task;
    }
}
