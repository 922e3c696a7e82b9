//! Synchronization building blocks used inside the scheduling core.

pub mod atomic;
pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
