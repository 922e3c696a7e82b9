//! Scheduling policy classes.
//!
//! A policy class decides how a thread's priority translates into a ready
//! queue position and whether the thread round-robins within its tier. The
//! core is polymorphic over the [`SchedClass`] capability set: computing the
//! weighted priority, picking the next thread from the class's ready queue,
//! the round-robin quantum, and diagnostics rendering.
//!
//! Classes are layered by weight: every fifo-tier priority outranks every
//! weak-tier priority, and the per-CPU root thread sits below everything as
//! the idle fallback. The set of classes is closed; `CLASSES` lists them in
//! precedence order.

use crate::Error;
use crate::clock::Nanos;
use crate::sched::{ClassQueues, PrioQueue};
use crate::thread::ThreadId;
use alloc::string::String;
use core::fmt::Write;

/// Lowest admissible fifo/round-robin priority.
pub const FIFO_MIN_PRIO: i32 = 1;
/// Highest admissible fifo/round-robin priority.
pub const FIFO_MAX_PRIO: i32 = 99;
/// Lowest admissible weak priority.
pub const WEAK_MIN_PRIO: i32 = 0;
/// Highest admissible weak priority.
pub const WEAK_MAX_PRIO: i32 = 99;
/// Priority of the per-CPU root (idle) threads.
pub const IDLE_PRIO: i32 = -1;

/// Scheduling policy and its parameters, as requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedParam {
    /// Fixed-priority real-time, first-in first-out among equals.
    Fifo {
        /// Priority within [`FIFO_MIN_PRIO`]..=[`FIFO_MAX_PRIO`].
        prio: i32,
    },
    /// Fixed-priority real-time, round-robin among equals.
    RoundRobin {
        /// Priority within [`FIFO_MIN_PRIO`]..=[`FIFO_MAX_PRIO`].
        prio: i32,
        /// Time slice before the thread rotates to the tail of its tier.
        quantum: Nanos,
    },
    /// Best-effort class layered below every real-time tier.
    Weak {
        /// Priority within [`WEAK_MIN_PRIO`]..=[`WEAK_MAX_PRIO`].
        prio: i32,
    },
    /// Idle sentinel; reserved for the per-CPU root threads.
    Idle,
}

impl SchedParam {
    /// The priority carried by the parameters.
    pub fn prio(&self) -> i32 {
        match *self {
            SchedParam::Fifo { prio } => prio,
            SchedParam::RoundRobin { prio, .. } => prio,
            SchedParam::Weak { prio } => prio,
            SchedParam::Idle => IDLE_PRIO,
        }
    }

    /// The class implementing these parameters.
    pub(crate) fn class(&self) -> &'static dyn SchedClass {
        match self {
            SchedParam::Fifo { .. } | SchedParam::RoundRobin { .. } => &FIFO_CLASS,
            SchedParam::Weak { .. } => &WEAK_CLASS,
            SchedParam::Idle => &IDLE_CLASS,
        }
    }
}

/// A scheduling policy class.
///
/// Implementations never touch thread control blocks directly; they operate
/// on priorities, parameters and their own ready queue inside
/// [`ClassQueues`].
pub trait SchedClass: Send + Sync {
    /// Class name for diagnostics.
    fn name(&self) -> &'static str;

    /// Priority offset layering this class against the others.
    fn weight(&self) -> i32;

    /// Validates policy parameters for this class.
    fn check(&self, param: &SchedParam) -> Result<(), Error>;

    /// Effective queueing priority of a thread of this class running at
    /// `cprio`.
    fn weighted_prio(&self, cprio: i32) -> i32 {
        self.weight() + cprio
    }

    /// This class's ready queue, if it keeps one.
    fn queue<'a>(&self, queues: &'a mut ClassQueues) -> Option<&'a mut PrioQueue>;

    /// Picks the next thread of this class to run, removing it from the
    /// class's ready queue.
    fn pick(&self, queues: &mut ClassQueues) -> Option<(i32, ThreadId)> {
        self.queue(queues).and_then(|q| q.pop_highest())
    }

    /// Round-robin quantum for the given parameters; `None` disables
    /// rotation.
    fn quantum(&self, param: &SchedParam) -> Option<Nanos> {
        let _ = param;
        None
    }

    /// Whether a kicked thread of this class needs an explicit CPU grant to
    /// reach its trap (budget-based classes withhold CPU from runnable
    /// threads; the built-in classes do not).
    fn force_grant(&self, param: &SchedParam) -> bool {
        let _ = param;
        false
    }

    /// Approximate priority to mirror into the host scheduler when the
    /// thread runs in-band.
    fn map_inband_prio(&self, cprio: i32) -> i32 {
        let _ = cprio;
        0
    }

    /// Renders the parameters for diagnostics.
    fn render(&self, param: &SchedParam, out: &mut String);
}

/// Fixed-priority real-time class; covers both fifo and round-robin
/// parameters.
pub struct FifoClass;

/// The fixed-priority real-time class instance.
pub static FIFO_CLASS: FifoClass = FifoClass;

impl SchedClass for FifoClass {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn weight(&self) -> i32 {
        256
    }

    fn check(&self, param: &SchedParam) -> Result<(), Error> {
        match *param {
            SchedParam::Fifo { prio } if (FIFO_MIN_PRIO..=FIFO_MAX_PRIO).contains(&prio) => Ok(()),
            SchedParam::RoundRobin { prio, quantum }
                if (FIFO_MIN_PRIO..=FIFO_MAX_PRIO).contains(&prio) && quantum > 0 =>
            {
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    fn queue<'a>(&self, queues: &'a mut ClassQueues) -> Option<&'a mut PrioQueue> {
        Some(&mut queues.fifo)
    }

    fn quantum(&self, param: &SchedParam) -> Option<Nanos> {
        match *param {
            SchedParam::RoundRobin { quantum, .. } => Some(quantum),
            _ => None,
        }
    }

    fn map_inband_prio(&self, cprio: i32) -> i32 {
        cprio
    }

    fn render(&self, param: &SchedParam, out: &mut String) {
        match *param {
            SchedParam::RoundRobin { prio, quantum } => {
                let _ = write!(out, "rr:{prio}:{quantum}");
            }
            _ => {
                let _ = write!(out, "fifo:{}", param.prio());
            }
        }
    }
}

/// Best-effort class; its threads only run when no real-time thread is
/// ready.
pub struct WeakClass;

/// The weak class instance.
pub static WEAK_CLASS: WeakClass = WeakClass;

impl SchedClass for WeakClass {
    fn name(&self) -> &'static str {
        "weak"
    }

    fn weight(&self) -> i32 {
        0
    }

    fn check(&self, param: &SchedParam) -> Result<(), Error> {
        match *param {
            SchedParam::Weak { prio } if (WEAK_MIN_PRIO..=WEAK_MAX_PRIO).contains(&prio) => Ok(()),
            _ => Err(Error::InvalidArgument),
        }
    }

    fn queue<'a>(&self, queues: &'a mut ClassQueues) -> Option<&'a mut PrioQueue> {
        Some(&mut queues.weak)
    }

    fn render(&self, param: &SchedParam, out: &mut String) {
        let _ = write!(out, "weak:{}", param.prio());
    }
}

/// Idle sentinel class backing the per-CPU root threads.
pub struct IdleClass;

/// The idle class instance.
pub static IDLE_CLASS: IdleClass = IdleClass;

impl SchedClass for IdleClass {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn weight(&self) -> i32 {
        0
    }

    fn check(&self, _param: &SchedParam) -> Result<(), Error> {
        // Only the core itself instantiates idle threads.
        Err(Error::InvalidArgument)
    }

    fn queue<'a>(&self, _queues: &'a mut ClassQueues) -> Option<&'a mut PrioQueue> {
        None
    }

    fn render(&self, _param: &SchedParam, out: &mut String) {
        let _ = write!(out, "idle");
    }
}

/// All classes, in precedence order.
pub(crate) static CLASSES: [&'static dyn SchedClass; 3] = [&FIFO_CLASS, &WEAK_CLASS, &IDLE_CLASS];
