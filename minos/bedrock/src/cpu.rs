//! Execution contexts of the simulated CPU.
//!
//! A [`Context`] is the machine-level half of a kernel thread: a stack and a
//! saved register state. The machine backs every context with a host thread
//! and passes a single CPU baton between them. A context only executes while
//! it holds the baton; [`Context::switch_to`] hands the baton to another
//! context and blocks until somebody hands it back.
//!
//! A context terminates by unwinding to its trampoline with [`exit`]. The
//! trampoline then runs the `retire` routine given at spawn time, which is
//! expected to hand the baton to the next context. Any other unwind is a
//! kernel panic: the machine crashes and the panic is re-raised on the host
//! side by [`machine::run`].
//!
//! [`machine::run`]: crate::machine::run
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Condvar, Mutex, PoisonError},
};

/// Size of each context's stack.
pub const STACK_SIZE: usize = 0x80_0000;

/// Unwinding payload used to terminate the running context.
#[derive(Debug)]
pub struct ContextExit(pub i32);

struct Baton {
    turn: Mutex<bool>,
    cv: Condvar,
}

impl Baton {
    fn give(&self) {
        let mut turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        *turn = true;
        self.cv.notify_one();
    }

    fn take(&self) {
        let mut turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        while !*turn {
            turn = self.cv.wait(turn).unwrap_or_else(PoisonError::into_inner);
        }
        *turn = false;
    }
}

/// A saved execution context.
#[derive(Clone)]
pub struct Context {
    baton: Arc<Baton>,
}

impl Context {
    /// Creates a context that starts executing `entry` once it is first
    /// resumed.
    ///
    /// When `entry` returns or the context calls [`exit`], `retire` runs with
    /// the exit code on the same context. It must pass the CPU to another
    /// context (or idle the machine) before returning.
    pub fn spawn<F, R>(name: &str, entry: F, retire: R) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
        R: FnOnce(i32) + Send + 'static,
    {
        let baton = Arc::new(Baton {
            turn: Mutex::new(false),
            cv: Condvar::new(),
        });
        let own = baton.clone();
        std::thread::Builder::new()
            .name(name.into())
            .stack_size(STACK_SIZE)
            .spawn(move || {
                own.take();
                drop(own);
                let code = match catch_unwind(AssertUnwindSafe(entry)) {
                    Ok(()) => 0,
                    Err(payload) => match payload.downcast::<ContextExit>() {
                        Ok(exit) => exit.0,
                        Err(payload) => return crate::machine::crash(payload),
                    },
                };
                retire(code);
            })?;
        Ok(Self { baton })
    }

    /// Hands the CPU to `next` and blocks until this context is resumed.
    pub fn switch_to(&self, next: &Context) {
        next.resume();
        self.suspend();
    }

    /// Hands the CPU to this context.
    pub fn resume(&self) {
        self.baton.give();
    }

    /// Blocks the running context until it is resumed.
    pub fn suspend(&self) {
        self.baton.take();
    }
}

/// Terminates the running context with `code`.
///
/// The stack is unwound up to the context trampoline, dropping every live
/// value on the way, and the context's `retire` routine runs.
pub fn exit(code: i32) -> ! {
    std::panic::resume_unwind(Box::new(ContextExit(code)))
}

/// Returns true while the running context is unwinding, either to exit or
/// because of a panic.
pub fn unwinding() -> bool {
    std::thread::panicking()
}
