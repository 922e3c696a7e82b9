//! Console print utilities.
//!
//! The scheduling core has no console of its own; the host registers a
//! [`core::fmt::Write`] sink with [`set_console`] and every diagnostic macro
//! in the crate funnels through it. When no sink is registered, output is
//! silently dropped.

use crate::sync::SpinLock;
use alloc::boxed::Box;
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};

static CONSOLE: SpinLock<Option<Box<dyn Write + Send>>> = SpinLock::new(None);

/// When set, suppresses [`info!`](crate::info), [`warning!`](crate::warning)
/// and [`debug!`](crate::debug) output.
pub static QUIET: AtomicBool = AtomicBool::new(false);

/// Register the console sink used by the printing macros.
///
/// Replaces any previously registered sink.
pub fn set_console(sink: Box<dyn Write + Send>) {
    let mut guard = CONSOLE.lock();
    *guard = Some(sink);
    guard.unlock();
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let mut guard = CONSOLE.lock();
    if let Some(sink) = guard.as_mut() {
        let _ = write!(sink, "{fmt}");
    }
    guard.unlock();
}

#[doc(hidden)]
pub fn _quiet() -> bool {
    QUIET.load(Ordering::SeqCst)
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the registered console sink.
/// This first holds the lock for the console sink.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the registered console sink.
/// This first holds the lock for the console sink.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    () => (if !$crate::kprint::_quiet() { $crate::print!("[INFO]\n") });
    ($($arg:tt)*) => (if !$crate::kprint::_quiet() { $crate::print!("[INFO] {}\n", format_args!($($arg)*)) });
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    () => (if !$crate::kprint::_quiet() { $crate::print!("[WARN]\n") });
    ($($arg:tt)*) => (if !$crate::kprint::_quiet() { $crate::print!("[WARN] {}\n", format_args!($($arg)*)) });
}

/// Display a debug message.
#[macro_export]
macro_rules! debug {
    () => (if !$crate::kprint::_quiet() { $crate::print!("[DEBUG]\n") });
    ($($arg:tt)*) => (if !$crate::kprint::_quiet() { $crate::print!("[DEBUG] {}\n", format_args!($($arg)*))} );
}
