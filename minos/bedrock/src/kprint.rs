//! Kernel print utilities.
//!
//! Everything the kernel prints lands in the console buffer of the machine,
//! which is handed back to whoever booted the machine when it halts. With the
//! `echo` feature (or [`MachineConfig::echo`]) every byte is mirrored to the
//! host stdout as well.
//!
//! The console also owns the keyboard: a bounded queue of input bytes that
//! the kernel drains with [`getc`].
//!
//! [`MachineConfig::echo`]: crate::machine::MachineConfig::echo
use crate::spinlock::SpinLock;
use core::{
    fmt::Write,
    sync::atomic::{AtomicU8, Ordering},
};
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// Minimum capacity of the keyboard queue.
pub const INPUT_BUFFER_SIZE: usize = 64;

struct Console {
    output: String,
    echo: bool,
}

static CONSOLE: SpinLock<Console> = SpinLock::new(Console {
    output: String::new(),
    echo: cfg!(feature = "echo"),
});
static INPUT: SpinLock<Option<Arc<ArrayQueue<u8>>>> = SpinLock::new(None);
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warning as u8);

/// Severity of a log message.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Everything, including debug messages.
    Debug = 0,
    /// Informational messages and above.
    Info = 1,
    /// Warnings only.
    Warning = 2,
    /// Nothing but plain prints.
    Quiet = 3,
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if self.echo {
            std::print!("{s}");
        }
        self.output.push_str(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let mut guard = CONSOLE.lock();
    let _ = write!(&mut *guard, "{fmt}");
    guard.unlock();
}

#[doc(hidden)]
pub fn _log(level: LogLevel, tag: &str, fmt: core::fmt::Arguments<'_>) {
    if enabled(level) {
        _print(format_args!("[{tag}] {fmt}\n"));
    }
}

/// Returns true if messages of `level` are printed.
pub fn enabled(level: LogLevel) -> bool {
    level as u8 >= LEVEL.load(Ordering::SeqCst)
}

/// Sets the minimum level of printed log messages.
pub fn set_log_level(level: LogLevel) {
    LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Reads a byte from the keyboard, if one is pending.
pub fn getc() -> Option<u8> {
    let guard = INPUT.lock();
    let queue = (*guard).clone();
    guard.unlock();
    queue.and_then(|q| q.pop())
}

/// Clears the console and loads the keyboard queue with `input`.
pub(crate) fn reset(echo: bool, level: LogLevel, input: &[u8]) {
    let mut console = CONSOLE.lock();
    console.output.clear();
    console.echo = echo || cfg!(feature = "echo");
    console.unlock();

    let queue = ArrayQueue::new(input.len().max(INPUT_BUFFER_SIZE));
    for b in input {
        let _ = queue.push(*b);
    }
    let mut guard = INPUT.lock();
    *guard = Some(Arc::new(queue));
    guard.unlock();

    set_log_level(level);
}

/// Takes everything printed on the console so far.
pub(crate) fn take_output() -> String {
    let mut console = CONSOLE.lock();
    let output = core::mem::take(&mut console.output);
    console.unlock();
    output
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
///
/// Use the format! syntax to write data to the console.
/// This first holds the lock for console device.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::kprint::_log($crate::kprint::LogLevel::Info, "INFO", format_args!($($arg)*)));
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::kprint::_log($crate::kprint::LogLevel::Warning, "WARN", format_args!($($arg)*)));
}

/// Display a debug message.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => ($crate::kprint::_log($crate::kprint::LogLevel::Debug, "DEBUG", format_args!($($arg)*)));
}
