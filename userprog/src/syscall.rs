//! # System call ABI.
//!
//! A user program requests a kernel service with the `syscall` instruction.
//! The request travels in registers:
//!
//! 1. The **system call number** is passed in `%rax`.
//! 2. The **arguments** are passed in `%rdi`, `%rsi`, `%rdx`, `%r10`, `%r8`
//!    and `%r9`, in this order.
//! 3. The **return value** is stored to `%rax`.
//!
//! Handlers report their outcome as `Result<usize, KernelError>`. User
//! programs see every error as `-1`; the kernel keeps the precise
//! [`KernelError`] for its own logs. [`KernelError::BadAddress`] never reaches
//! the program: it terminates the process first.
use minos::{KernelError, syscall::Registers};

/// A struct representing the system call ABI.
pub struct SyscallAbi<'a> {
    /// The system call number.
    pub sysno: usize,
    /// The first argument of the system call.
    pub arg1: usize,
    /// The second argument of the system call.
    pub arg2: usize,
    /// The third argument of the system call.
    pub arg3: usize,
    /// The fourth argument of the system call.
    pub arg4: usize,
    /// The fifth argument of the system call.
    pub arg5: usize,
    /// The sixth argument of the system call.
    pub arg6: usize,
    /// A mutable reference to the [`Registers`].
    pub regs: &'a mut Registers,
}

impl<'a> SyscallAbi<'a> {
    /// Decodes the system call in `regs`.
    pub fn from_registers(regs: &'a mut Registers) -> Self {
        let gprs = regs.gprs;
        Self {
            sysno: gprs.rax,
            arg1: gprs.rdi,
            arg2: gprs.rsi,
            arg3: gprs.rdx,
            arg4: gprs.r10,
            arg5: gprs.r8,
            arg6: gprs.r9,
            regs,
        }
    }

    /// Stores the result of the system call in `rax`.
    ///
    /// Errors are reported as `-1`.
    pub fn set_return_value(self, return_val: Result<usize, KernelError>) {
        self.regs.gprs.rax = match return_val {
            Ok(v) => v,
            Err(_) => -1isize as usize,
        };
    }
}
