//! Machine lifecycle.
//!
//! [`run`] boots a machine, lets it execute until it halts and returns a
//! [`Report`]. A machine halts when:
//!
//! - the CPU goes idle: no context is runnable any more ([`idle`]);
//! - the kernel powers it off ([`power_off`]);
//! - a context panics. The panic is re-raised from [`run`].
//!
//! Only one machine runs at a time on the host; concurrent callers of [`run`]
//! queue up.
use crate::kprint::LogLevel;
use std::{
    any::Any,
    sync::{Condvar, Mutex, PoisonError},
};

/// Why the machine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// No context was left runnable.
    Idle,
    /// The kernel powered the machine off.
    PowerOff,
}

/// What a halted machine leaves behind.
#[derive(Debug)]
pub struct Report {
    /// Why the machine stopped.
    pub halt: Halt,
    /// Everything printed on the console.
    pub console: String,
}

/// Boot-time configuration of the machine.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Mirror the console to the host stdout.
    pub echo: bool,
    /// Minimum level of printed log messages.
    pub log_level: LogLevel,
    /// Bytes waiting in the keyboard queue at boot.
    pub input: Vec<u8>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            echo: false,
            log_level: LogLevel::Warning,
            input: Vec::new(),
        }
    }
}

enum Stop {
    Halted(Halt),
    Crashed(Box<dyn Any + Send>),
}

static SERIAL: Mutex<()> = Mutex::new(());
static STOP: Mutex<Option<Stop>> = Mutex::new(None);
static STOPPED: Condvar = Condvar::new();

fn stop(reason: Stop) {
    let mut guard = STOP.lock().unwrap_or_else(PoisonError::into_inner);
    if guard.is_none() {
        *guard = Some(reason);
    }
    STOPPED.notify_all();
}

/// Boots a machine and runs it until it halts.
///
/// `start` runs on the host before the CPU starts; it must create the first
/// context and resume it.
///
/// # Panics
///
/// Re-raises the panic of any context that panicked.
pub fn run(config: MachineConfig, start: impl FnOnce()) -> Report {
    let serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    *STOP.lock().unwrap_or_else(PoisonError::into_inner) = None;
    crate::interrupt::reset();
    crate::kprint::reset(config.echo, config.log_level, &config.input);

    start();

    let mut guard = STOP.lock().unwrap_or_else(PoisonError::into_inner);
    let reason = loop {
        match guard.take() {
            Some(reason) => break reason,
            None => guard = STOPPED.wait(guard).unwrap_or_else(PoisonError::into_inner),
        }
    };
    drop(guard);

    let console = crate::kprint::take_output();
    drop(serial);
    match reason {
        Stop::Halted(halt) => Report { halt, console },
        Stop::Crashed(payload) => std::panic::resume_unwind(payload),
    }
}

/// Halts the machine because no context is runnable.
pub fn idle() {
    stop(Stop::Halted(Halt::Idle));
}

/// Powers the machine off. The calling context never runs again.
pub fn power_off() -> ! {
    stop(Stop::Halted(Halt::PowerOff));
    loop {
        std::thread::park();
    }
}

/// Crashes the machine with a panic payload.
pub(crate) fn crash(payload: Box<dyn Any + Send>) {
    stop(Stop::Crashed(payload));
}
