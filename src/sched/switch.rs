//! The cross-domain switch protocol.
//!
//! A thread's two backings must never both be scheduled at once. Authority
//! is tracked by the [`crate::thread::ThreadState::INBAND`] bit, and the two
//! functions in this module are its only legal mutators. Authority is also
//! reflected in the type system: a thread holds exactly one of
//! [`OobToken`] or [`InbandToken`] at any time, each operation consumes the
//! token for the domain it leaves and produces the other, and oob-only
//! operations (sleeping, pending on a wait channel) demand an `OobToken`.
//! Calling them from in-band context is therefore a compile-time error, not
//! a runtime check.
//!
//! The mechanics of moving the CPU between interrupt stages belong to the
//! host ([`crate::host::HostOps::leave_inband`] and the deferred wake
//! request of [`crate::work`]); this module only keeps the bookkeeping
//! around that transfer consistent, including the signal/cancellation race
//! on the way out.

use super::{SchedulerCore, resume, suspend};
use crate::clock::Timeout;
use crate::thread::{ThreadId, ThreadInfo, ThreadState};
use crate::work::Work;
use crate::{Error, debug};
use core::marker::PhantomData;

/// Proof that the holding execution context runs the given thread under the
/// oob scheduler's authority.
///
/// Not sendable: the token stands for "the current execution context", so it
/// must not leak to another one.
pub struct OobToken {
    id: ThreadId,
    _ctx: PhantomData<*mut ()>,
}

impl OobToken {
    pub(crate) fn new(id: ThreadId) -> Self {
        Self {
            id,
            _ctx: PhantomData,
        }
    }

    /// The thread this token stands for.
    pub fn thread(&self) -> ThreadId {
        self.id
    }

    pub(crate) fn into_thread(self) -> ThreadId {
        self.id
    }
}

/// Proof that the holding execution context runs the given thread under the
/// in-band scheduler's authority.
pub struct InbandToken {
    id: ThreadId,
    _ctx: PhantomData<*mut ()>,
}

impl InbandToken {
    pub(crate) fn new(id: ThreadId) -> Self {
        Self {
            id,
            _ctx: PhantomData,
        }
    }

    /// The thread this token stands for.
    pub fn thread(&self) -> ThreadId {
        self.id
    }

    pub(crate) fn into_thread(self) -> ThreadId {
        self.id
    }
}

/// Why a thread is leaving the oob domain; anything but `Undefined` is
/// reported to the observer layer for threads that asked for mode-switch
/// warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InbandCause {
    /// No specific cause (internal transition).
    Undefined,
    /// The thread needed an in-band-only service.
    SysDemand,
    /// A signal must be delivered in-band.
    Signal,
    /// A fault must be handled in-band.
    Fault,
    /// Cancellation is being delivered.
    Canceled,
    /// The watchdog expired on this thread.
    Watchdog,
}

/// A failed [`SchedulerCore::switch_to_oob`]; hands the in-band token back
/// so the caller can retry or bail out.
pub struct SwitchError {
    /// The caller's domain token, still valid for the in-band domain.
    pub token: InbandToken,
    /// Why the switch did not happen.
    pub error: Error,
}

impl SchedulerCore {
    /// Switches the calling thread from the oob domain to the in-band
    /// domain.
    ///
    /// Queues the deferred request that will wake the in-band backing once
    /// in-band dispatch resumes, hands the CPU back to the oob scheduler for
    /// the next oob thread, and performs the in-band-side fixups: pending
    /// schedparam propagation, CPU-pinning repair after a migration, stale
    /// boost drop, and the observer notification when armed.
    pub fn switch_to_inband(&self, tok: OobToken, cause: InbandCause) -> InbandToken {
        let id = tok.into_thread();
        let now = self.clock.now();
        let mut task = None;
        let mut schedp = None;
        let mut pin = None;
        let mut warn = false;
        self.with_core(|c, post| {
            {
                let t = c.threads.get_mut(&id).unwrap();
                t.stats.core_calls += 1;
                t.stats.inband_switches += 1;
                let bound = t.host_task.expect("domain switch on an unbound thread");
                task = Some(bound);
                post.push(Work::WakeTask(bound));
            }
            suspend(c, now, id, ThreadState::INBAND, Timeout::Infinite, None, post);
            {
                let t = c.threads.get_mut(&id).unwrap();
                if t.info.contains(ThreadInfo::SCHEDP) {
                    t.info.remove(ThreadInfo::SCHEDP);
                    schedp = Some(t.class.map_inband_prio(t.cprio));
                }
                if !t.affinity.contains(t.cpu) {
                    // A deferred affinity change caught up with us; repair
                    // the run-queue binding from the thread's own context.
                    let target = t.affinity.first().unwrap();
                    t.cpu = target;
                }
                if t.cpu != t.last_inband_cpu {
                    pin = Some(t.cpu);
                    t.last_inband_cpu = t.cpu;
                }
                warn = t.state.contains(ThreadState::USER) && t.state.contains(ThreadState::WARN);
            }
            crate::wait::drop_stale_boost(c, id, now, post);
        });
        // From here the thread formally runs in-band; the host dispatch will
        // consume the queued wake request.
        let task = task.unwrap();
        if let Some(prio) = schedp {
            self.host.set_inband_schedparam(task, prio);
        }
        if let Some(cpu) = pin {
            self.host.pin_task(task, cpu);
        }
        if warn && cause != InbandCause::Undefined {
            self.host.notify_mode_switch(task, cause);
        }
        InbandToken::new(id)
    }

    /// Switches the calling thread from the in-band domain to the oob
    /// domain.
    ///
    /// Fails with [`Error::Stale`] when the thread has already been
    /// dismantled, [`Error::Again`] when the host refuses the stage
    /// transfer (retry), and [`Error::Interrupted`] when a signal or
    /// cancellation raced the transfer; in every failure case the in-band
    /// token comes back in the [`SwitchError`].
    pub fn switch_to_oob(&self, tok: InbandToken) -> Result<OobToken, SwitchError> {
        let id = tok.thread();
        let task = match self.with_core(|c, _| {
            let t = c.threads.get_mut(&id).ok_or(Error::Stale)?;
            if t.state.contains(ThreadState::ZOMBIE) {
                return Err(Error::Stale);
            }
            if t.state.contains(ThreadState::DORMANT) {
                // Not started yet; the oob side has nothing to run.
                return Err(Error::OperationNotPermitted);
            }
            t.stats.core_calls += 1;
            t.host_task.ok_or(Error::OperationNotPermitted)
        }) {
            Ok(task) => task,
            Err(error) => return Err(SwitchError { token: tok, error }),
        };

        if self.host.signal_pending(task) {
            return Err(SwitchError {
                token: tok,
                error: Error::Interrupted,
            });
        }
        if self.host.leave_inband().is_err() {
            // The host scheduler still has work for this task; back off and
            // let the caller retry.
            return Err(SwitchError {
                token: tok,
                error: Error::Again,
            });
        }
        let now = self.clock.now();
        self.with_core(|c, post| {
            {
                let t = c.threads.get_mut(&id).unwrap();
                t.stats.oob_switches += 1;
            }
            resume(c, now, id, ThreadState::INBAND, post);
        });

        // A signal or a cancellation may have been queued during the
        // transfer window; if so, head straight back in-band.
        let canceled = self.cancel_pending(id);
        if canceled || self.host.signal_pending(task) {
            debug!("thread {:?}: oob switch raced a signal, backing out", id);
            self.with_core(|c, post| {
                post.push(Work::WakeTask(task));
                suspend(c, now, id, ThreadState::INBAND, Timeout::Infinite, None, post);
            });
            return Err(SwitchError {
                token: InbandToken::new(id),
                error: Error::Interrupted,
            });
        }
        Ok(OobToken::new(id))
    }
}
