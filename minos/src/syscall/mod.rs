//! System call infrastructure.
//!
//! A user program enters the kernel with [`crate::user::UserContext::syscall`].
//! The kernel hands the register file to the [`Task`] of the current thread,
//! which decodes the system call, serves it and stores the result in `rax`.
//!
//! User memory named by system call arguments is accessed through the
//! [`uaccess`] wrappers, which validate every address against the address
//! space of the caller.
pub use bedrock::interrupt::Registers;
#[cfg(doc)]
use crate::task::Task;
use crate::task::with_current_task;

pub mod uaccess;

/// Dispatches the system call in `frame` to the task of the current thread.
///
/// # Panics
///
/// Panics if the current thread carries no task.
#[doc(hidden)]
pub fn do_handle_syscall(frame: &mut Registers) {
    if with_current_task(|task| task.syscall(frame)).is_none() {
        panic!("Unexpected `syscall` instruction.")
    }
}
