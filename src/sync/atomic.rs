//! A wrapper around the core::sync::atomic.
//!
//! These wrappers default every operation to [`Ordering::SeqCst`], which is
//! the only ordering the scheduling core relies on for its out-of-lock
//! counters (thread ids, live-thread count). Code that needs a weaker
//! ordering should use [`core::sync::atomic`] directly.

use core::sync::atomic::Ordering;

/// A boolean type which can be safely shared between threads.
#[derive(Default)]
pub struct AtomicBool(core::sync::atomic::AtomicBool);

impl AtomicBool {
    /// Creates a new `AtomicBool`.
    #[inline]
    #[must_use]
    pub const fn new(v: bool) -> AtomicBool {
        Self(core::sync::atomic::AtomicBool::new(v))
    }

    /// Loads a value from the bool.
    #[inline]
    pub fn load(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Stores a value into the bool.
    #[inline]
    pub fn store(&self, val: bool) {
        self.0.store(val, Ordering::SeqCst)
    }

    /// Stores a value into the bool, returning the previous value.
    #[inline]
    pub fn swap(&self, val: bool) -> bool {
        self.0.swap(val, Ordering::SeqCst)
    }
}

/// An integer type which can be safely shared between threads.
#[derive(Default)]
pub struct AtomicU64(core::sync::atomic::AtomicU64);

impl AtomicU64 {
    /// Creates a new `AtomicU64`.
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> AtomicU64 {
        Self(core::sync::atomic::AtomicU64::new(v))
    }

    /// Loads a value from the integer.
    #[inline]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Stores a value into the integer.
    #[inline]
    pub fn store(&self, val: u64) {
        self.0.store(val, Ordering::SeqCst)
    }

    /// Adds to the current value, returning the previous value.
    #[inline]
    pub fn fetch_add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::SeqCst)
    }
}

/// A pointer-sized integer type which can be safely shared between threads.
#[derive(Default)]
pub struct AtomicUsize(core::sync::atomic::AtomicUsize);

impl AtomicUsize {
    /// Creates a new `AtomicUsize`.
    #[inline]
    #[must_use]
    pub const fn new(v: usize) -> AtomicUsize {
        Self(core::sync::atomic::AtomicUsize::new(v))
    }

    /// Loads a value from the integer.
    #[inline]
    pub fn load(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Stores a value into the integer.
    #[inline]
    pub fn store(&self, val: usize) {
        self.0.store(val, Ordering::SeqCst)
    }

    /// Adds to the current value, returning the previous value.
    #[inline]
    pub fn fetch_add(&self, val: usize) -> usize {
        self.0.fetch_add(val, Ordering::SeqCst)
    }

    /// Subtracts from the current value, returning the previous value.
    #[inline]
    pub fn fetch_sub(&self, val: usize) -> usize {
        self.0.fetch_sub(val, Ordering::SeqCst)
    }
}
