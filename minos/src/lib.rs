//! # MINOS: Minimal INstructional Operating System
//!
//! MINOS is a small teaching kernel that runs on a simulated uniprocessor
//! provided by [`bedrock`]. It offers the building blocks a user-program
//! kernel needs:
//!
//! - [`thread`]: kernel threads, parking and a priority scheduler.
//! - [`sync`]: semaphores, locks with priority donation and condition
//!   variables.
//! - [`mm`]: a bounded page pool and per-process address spaces.
//! - [`fs`]: the file abstraction over a pluggable filesystem.
//! - [`loader`] and [`user`]: executable images and user-mode execution.
//! - [`syscall`]: system call ABI and user memory access.
//!
//! A kernel is started with [`SystemConfigurationBuilder::boot`], which runs
//! the given main routine as the first kernel thread and returns once the
//! machine halts.
#![no_std]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

#[macro_use]
extern crate bedrock;
extern crate alloc;

pub mod fs;
pub mod interrupt;
pub mod loader;
pub mod mm;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod thread;
pub mod user;

pub use bedrock::{
    addressing, debug, info,
    interrupt::Registers,
    kprint::{LogLevel, getc},
    machine::{Halt, Report, power_off},
    print, println, warning,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use bedrock::machine::MachineConfig;
use thread::scheduler::{PriorityScheduler, Scheduler};

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// while serving a kernel operation. System calls report every error to user
/// programs as `-1`, except [`KernelError::BadAddress`] and
/// [`KernelError::NoSuchSyscall`], which terminate the offending process.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// BAD file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Bad address. (EFAULT)
    BadAddress,
    /// File exists. (EEXIST)
    FileExist,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No child processes. (ECHILD)
    NoChild,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
}

/// Default upper bound of live kernel threads.
pub const DEFAULT_MAX_THREADS: usize = 512;
/// Default upper bound of allocated pages.
pub const DEFAULT_MAX_PAGES: usize = 4096;

/// A builder for system configuration settings.
///
/// The [`SystemConfigurationBuilder`] struct provides an interface for
/// configuring system-wide settings before the machine boots: the scheduling
/// policy, resource limits and the console.
///
/// ```
/// let report = SystemConfigurationBuilder::new()
///     .max_pages(64)
///     .input(b"hello")
///     .boot(|| println!("Hello, MINOS!"));
/// assert_eq!(report.console, "Hello, MINOS!\n");
/// ```
pub struct SystemConfigurationBuilder {
    machine: MachineConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    max_threads: usize,
    max_pages: usize,
}

impl Default for SystemConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemConfigurationBuilder {
    /// Creates a configuration with the default settings.
    pub fn new() -> Self {
        Self {
            machine: MachineConfig::default(),
            scheduler: None,
            max_threads: DEFAULT_MAX_THREADS,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Sets the system-wide scheduler.
    ///
    /// Without this, the kernel runs the [`PriorityScheduler`].
    pub fn set_scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }

    /// Limits the number of live kernel threads.
    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    /// Limits the number of pages the kernel can hand out.
    pub fn max_pages(mut self, n: usize) -> Self {
        self.max_pages = n;
        self
    }

    /// Sets the minimum level of printed log messages.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.machine.log_level = level;
        self
    }

    /// Mirrors the console to the host stdout.
    pub fn echo(mut self, echo: bool) -> Self {
        self.machine.echo = echo;
        self
    }

    /// Preloads the keyboard with `input`.
    pub fn input(mut self, input: &[u8]) -> Self {
        self.machine.input = Vec::from(input);
        self
    }

    /// Boots the kernel and runs `main` as the first kernel thread.
    ///
    /// Returns when the machine halts: either nothing is left to run or the
    /// kernel powered the machine off.
    ///
    /// # Panics
    ///
    /// Re-raises any kernel panic.
    pub fn boot(self, main: impl FnOnce() + Send + 'static) -> Report {
        let Self {
            machine,
            scheduler,
            max_threads,
            max_pages,
        } = self;
        bedrock::machine::run(machine, move || {
            let scheduler: Arc<dyn Scheduler> = match scheduler {
                Some(scheduler) => scheduler,
                None => Arc::new(PriorityScheduler::new()),
            };
            thread::scheduler::set_scheduler(scheduler);
            thread::init(max_threads);
            mm::init(max_pages);
            sync::init();
            interrupt::init();
            fs::init();
            loader::init();
            user::init();
            interrupt::register(interrupt::TIMER_VECTOR, || {
                thread::scheduler::scheduler().timer_tick()
            });
            info!("MINOS: boot with {max_threads} threads and {max_pages} pages.");
            thread::start(Box::new(main));
        })
    }
}
