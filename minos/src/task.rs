//! The Task, an abstraction of a user process.
//!
//! A kernel thread may carry a [`Task`]. The task is the kernel-side state of
//! the user program running on the thread: it owns the address space and
//! serves the system calls and page faults the program raises.
//!
//! While the task serves an event it is taken out of its thread
//! ([`with_current_task`]), so the handler may block, spawn threads or exit
//! without holding any lock on the thread.
use crate::{
    mm::AddressSpace,
    thread::{Current, current},
};
use alloc::boxed::Box;
pub use bedrock::interrupt::PFErrorCode;
use bedrock::{addressing::Va, interrupt::Registers};
use core::ops::Range;

/// A trait that represents a task.
pub trait Task: Send {
    /// Handles a system call.
    ///
    /// `registers` hold the system call number in `rax` and its arguments in
    /// `rdi`, `rsi`, `rdx`, `r10`, `r8` and `r9`. The handler stores the
    /// return value in `rax`. A handler that replaces the program image
    /// (exec) also rewrites `rip` and `rsp`.
    fn syscall(&mut self, registers: &mut Registers);

    /// Handles a page fault at `va`.
    ///
    /// A fault raised by the user program terminates the thread with `-1`.
    /// A fault raised by the kernel is a kernel bug.
    fn page_fault(&mut self, ec: PFErrorCode, va: Va) -> ! {
        if ec.contains(PFErrorCode::USER) {
            kill_current_thread()
        } else {
            panic!("Unexpected page fault in Kernel at {va:?} because of {ec:?}")
        }
    }

    /// The address space of the task, if it has one.
    fn address_space(&self) -> Option<&AddressSpace> {
        None
    }

    /// The address space of the task, mutably.
    fn address_space_mut(&mut self) -> Option<&mut AddressSpace> {
        None
    }

    /// Checks whether the user program can access `addr`.
    fn access_ok(&self, addr: Range<Va>, is_write: bool) -> bool {
        self.address_space()
            .is_some_and(|aspace| aspace.access_ok(addr, is_write))
    }
}

impl Task for () {
    fn syscall(&mut self, _registers: &mut Registers) {
        unreachable!()
    }
}

/// Runs `f` on the task of the current thread.
///
/// Returns `None` if the thread carries no task. The task is detached from
/// the thread while `f` runs and attached back when it returns; if the
/// thread exits inside `f`, the task is dropped with the unwinding stack.
pub fn with_current_task<R>(f: impl FnOnce(&mut dyn Task) -> R) -> Option<R> {
    let th = current();
    let mut slot = th.task.lock();
    let task = slot.take();
    slot.unlock();
    let mut task: Box<dyn Task> = task?;

    let r = f(task.as_mut());

    let mut slot = th.task.lock();
    *slot = Some(task);
    slot.unlock();
    Some(r)
}

/// Terminates the current thread with `-1`.
pub fn kill_current_thread() -> ! {
    Current::exit(-1)
}
