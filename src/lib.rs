//! # Janus: a dual-context real-time scheduling core.
//!
//! Janus schedules threads across two cooperating execution domains: an
//! **out-of-band** (oob) domain governed by this crate's priority rules, and
//! the **in-band** domain governed by the host kernel's regular scheduler. A
//! thread is one logical entity with two backings; at any instant exactly one
//! of the two schedulers has authority over it, and the [`thread`] state
//! machine plus the [`sched::switch`] protocol keep both views consistent.
//!
//! ## The threading model
//!
//! Every schedulable entity is represented by a thread control block holding
//! a persistent state bitset, a transient info bitset, three priority fields
//! and two timers. Threads are created dormant, started explicitly, and run
//! under a per-CPU run queue until they block, switch domains, or exit. The
//! whole state machine is driven through a single [`sched::SchedulerCore`]
//! object; there are no ambient globals to configure.
//!
//! The host kernel is an external collaborator. Janus never performs a
//! context switch itself: it keeps the books (who is ready, who is current,
//! who owns the thread right now) and calls into the [`host::HostOps`] trait
//! for the mechanical parts: waking an in-band task, transferring an
//! execution context between domains, delivering a termination signal. This
//! keeps the crate free of architecture-specific code and makes the full
//! state machine testable from ordinary host-side tests.
//!
//! ## Getting started
//!
//! ```ignore
//! let core = janus::CoreBuilder::new()
//!     .nr_cpus(2)
//!     .build(Box::new(clock), Box::new(host));
//!
//! let kt = janus::thread::KthreadBuilder::new("worker")
//!     .param(SchedParam::Fifo { prio: 10 })
//!     .prepare(&core)?;
//! // ... from the backing in-band task:
//! kt.run(&core, task_id, |core, tok| {
//!     while !core.should_stop(tok) {
//!         core.sleep(tok, MILLIS)?;
//!     }
//! });
//! ```

#![no_std]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod clock;
pub mod host;
pub mod kprint;
pub mod sched;
pub mod sync;
pub mod thread;
mod timer;
pub mod wait;
pub mod work;

pub use sched::{CoreBuilder, SchedulerCore};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Maximum number of logical CPUs a [`SchedulerCore`] can manage.
pub const MAX_CPU: usize = 8;

/// Enum representing errors that can occur during a scheduling operation.
///
/// This enum is used to categorize errors encountered by the scheduling
/// core. Each variant corresponds to a specific type of error that might
/// occur while operating on a thread, and maps onto the conventional errno
/// value returned to user programs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(isize)]
pub enum Error {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted = -1,
    /// A blocking call was interrupted without obtaining the awaited
    /// resource. (EINTR)
    Interrupted = -4,
    /// The operation must be retried; the host refused a domain transfer
    /// because in-band work was pending. (EAGAIN)
    Again = -11,
    /// Out of memory. (ENOMEM)
    NoMemory = -12,
    /// Device or resource busy. (EBUSY)
    Busy = -16,
    /// Invalid argument. (EINVAL)
    InvalidArgument = -22,
    /// A thread attempted to join itself. (EDEADLK)
    Deadlock = -35,
    /// A timed wait elapsed before the awaited condition was satisfied.
    /// (ETIMEDOUT)
    TimedOut = -110,
    /// Operation attempted on a thread or wait object that has already been
    /// dismantled. (ESTALE)
    Stale = -116,
}

impl Error {
    /// Converts the [`Error`] into its errno value, cast to `usize` for use
    /// as a raw return value.
    pub fn into_usize(self) -> usize {
        isize::from(self) as usize
    }
}
