//! # User processes on MINOS.
//!
//! This crate turns MINOS threads into user processes. A process is a kernel
//! thread that carries a [`Process`] task: the address space of the program,
//! its file descriptor table, the executable it runs, and a link to the
//! [`ProcessControl`] record that outlives the thread until the parent
//! collects its exit status.
//!
//! ## Outline
//! - [`syscall`]: decoding of the system call ABI.
//! - [`guard`]: validation of user pointers. A bad pointer terminates the
//!   process with `-1` instead of crashing the kernel.
//! - [`file_struct`]: the file descriptor table and the file system calls.
//! - [`process`]: the process table, exec, wait and exit.
//! - [`fork`]: process duplication and the parent/child handshake.
//! - [`ulib`]: the user-side wrappers of every system call.
//!
//! Every filesystem operation issued by a system call runs under the global
//! [`FS_LOCK`], which takes part in priority donation like any other lock.
//!
//! [`ProcessControl`]: process::ProcessControl
#![deny(rustdoc::broken_intra_doc_links)]
#![no_std]

extern crate alloc;

pub mod file_struct;
pub mod fork;
pub mod guard;
pub mod process;
pub mod syscall;
pub mod ulib;

use minos::{
    KernelError,
    addressing::Va,
    debug,
    mm::AddressSpace,
    sync::Lock,
    syscall::Registers,
    task::{PFErrorCode, Task},
};
use num_enum::TryFromPrimitive;
use syscall::SyscallAbi;

pub use process::{Process, run_initd};

/// Serializes every filesystem operation issued by system calls.
pub static FS_LOCK: Lock = Lock::new();

/// Resets the process layer for a freshly booted machine.
///
/// Must run on the first kernel thread before any process is started.
pub fn init() {
    FS_LOCK.init();
    process::init();
}

/// System call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
pub enum SyscallNumber {
    /// Power off the machine.
    Halt = 0,
    /// Terminate the process.
    Exit = 1,
    /// Clone the process.
    Fork = 2,
    /// Replace the program image.
    Exec = 3,
    /// Wait for a child to exit.
    Wait = 4,
    /// Create a file.
    Create = 5,
    /// Remove a file.
    Remove = 6,
    /// Open a file.
    Open = 7,
    /// Size of an open file.
    Filesize = 8,
    /// Read from a file descriptor.
    Read = 9,
    /// Write to a file descriptor.
    Write = 10,
    /// Move the cursor of a file.
    Seek = 11,
    /// Position of the cursor of a file.
    Tell = 12,
    /// Close a file descriptor.
    Close = 13,
}

impl Task for Process {
    fn syscall(&mut self, regs: &mut Registers) {
        let mut abi = SyscallAbi::from_registers(regs);
        let return_val = match SyscallNumber::try_from(abi.sysno) {
            Ok(SyscallNumber::Halt) => minos::power_off(),
            Ok(SyscallNumber::Exit) => self.exit(abi.arg1 as i32),
            Ok(SyscallNumber::Fork) => self.fork(&abi),
            Ok(SyscallNumber::Exec) => self.exec(&mut abi),
            Ok(SyscallNumber::Wait) => self.wait(&abi),
            Ok(SyscallNumber::Create) => self.file_struct.create(&self.address_space, &abi),
            Ok(SyscallNumber::Remove) => self.file_struct.unlink(&self.address_space, &abi),
            Ok(SyscallNumber::Open) => self.file_struct.open(&self.address_space, &abi),
            Ok(SyscallNumber::Filesize) => self.file_struct.filesize(&abi),
            Ok(SyscallNumber::Read) => self.file_struct.read(&mut self.address_space, &abi),
            Ok(SyscallNumber::Write) => self.file_struct.write(&self.address_space, &abi),
            Ok(SyscallNumber::Seek) => self.file_struct.seek(&abi),
            Ok(SyscallNumber::Tell) => self.file_struct.tell(&abi),
            Ok(SyscallNumber::Close) => self.file_struct.close(&abi),
            Err(_) => Err(KernelError::NoSuchSyscall),
        };
        match return_val {
            Err(KernelError::NoSuchSyscall) => {
                debug!("{}: unknown system call #{}.", self.pcb.name, abi.sysno);
                self.exit(-1)
            }
            Err(KernelError::BadAddress) => self.exit(-1),
            _ => (),
        }
        abi.set_return_value(return_val);
    }

    fn page_fault(&mut self, ec: PFErrorCode, va: Va) -> ! {
        if ec.contains(PFErrorCode::USER) {
            debug!("{}: page fault at {va} ({ec:?}).", self.pcb.name);
            self.exit(-1)
        } else {
            panic!("Unexpected page fault in Kernel at {va:?} because of {ec:?}")
        }
    }

    fn address_space(&self) -> Option<&AddressSpace> {
        Some(&self.address_space)
    }

    fn address_space_mut(&mut self) -> Option<&mut AddressSpace> {
        Some(&mut self.address_space)
    }
}
