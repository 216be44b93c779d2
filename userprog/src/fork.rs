//! # Fork.
//!
//! `fork` creates a child process that continues from the same point as its
//! parent, with a copy of the parent's memory and open files. In the child
//! the system call returns 0; in the parent it returns the pid of the child.
//!
//! The copy is made by the child itself, on its own thread:
//!
//! 1. The parent creates the child's [`ProcessControl`], registers it as its
//!    child, and lends the child its address space, file table, running
//!    executable and register snapshot.
//! 2. The parent sleeps on the child's `fork_done`.
//! 3. The child copies every mapped page and reopens every open file. It
//!    returns the loan and raises `fork_done`, which is always its last
//!    synchronization step before running user code.
//! 4. The parent takes its resources back. If the child could not copy
//!    them, the child terminates as a zombie with the fork-failure status;
//!    the parent collects it at once and reports the failure.
//!
//! The copy is all-or-nothing: a failing child releases everything it copied
//! so far.
//!
//! [`ProcessControl`]: crate::process::ProcessControl
use crate::{
    FS_LOCK,
    file_struct::FileStruct,
    guard,
    process::{ExitStatus, Lifecycle, Process, ProcessControl},
    syscall::SyscallAbi,
};
use alloc::{boxed::Box, sync::Arc};
use minos::{
    KernelError, debug,
    fs::File,
    mm::AddressSpace,
    sync::SpinLock,
    syscall::Registers,
    thread::{Current, ThreadBuilder},
    user,
};

/// Resources the parent lends to its child during the fork.
struct Loan {
    file_struct: FileStruct,
    address_space: AddressSpace,
    running_file: Option<File>,
    regs: Registers,
}

type SharedLoan = Arc<SpinLock<Option<Loan>>>;

fn take(loan: &SharedLoan) -> Loan {
    let mut guard = loan.lock();
    let lent = guard.take();
    guard.unlock();
    match lent {
        Some(lent) => lent,
        None => panic!("Fork loan is missing."),
    }
}

fn give_back(loan: &SharedLoan, lent: Loan) {
    let mut guard = loan.lock();
    *guard = Some(lent);
    guard.unlock();
}

impl Process {
    /// Forks the process. The child is named after the string at `arg1`.
    pub fn fork(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let name = guard::check_string(&self.address_space, abi.arg1)?;
        let pcb = ProcessControl::new(&name, Some(&self.pcb));
        let loan: SharedLoan = Arc::new(SpinLock::new(Some(Loan {
            file_struct: core::mem::take(&mut self.file_struct),
            address_space: core::mem::take(&mut self.address_space),
            running_file: self.running_file.take(),
            regs: *abi.regs,
        })));

        let spawned = {
            let pcb = pcb.clone();
            let loan = loan.clone();
            ThreadBuilder::new(pcb.name).spawn(move || bootstrap(pcb, loan))
        };
        if let Err(e) = spawned {
            debug!("{}: fork failed to create a thread: {e:?}.", self.pcb.name);
            self.reclaim(&loan);
            self.pcb.remove_child(pcb.pid);
            pcb.reap();
            return Err(e);
        }

        pcb.fork_done.down();
        self.reclaim(&loan);

        if pcb.lifecycle() == Lifecycle::Zombie(ExitStatus::ForkFailed) {
            pcb.collect(&self.pcb)?;
            return Err(KernelError::NoMemory);
        }
        Ok(pcb.pid as usize)
    }

    fn reclaim(&mut self, loan: &SharedLoan) {
        let Loan {
            file_struct,
            address_space,
            running_file,
            ..
        } = take(loan);
        self.file_struct = file_struct;
        self.address_space = address_space;
        self.running_file = running_file;
    }
}

/// Copies the parent's resources into a fresh process.
fn duplicate(pcb: &Arc<ProcessControl>, lent: &Loan) -> Result<Process, KernelError> {
    let mut process = Process::new(pcb.clone());
    process.address_space = lent.address_space.duplicate()?;
    FS_LOCK.acquire();
    let files = lent.file_struct.duplicate().and_then(|file_struct| {
        let running_file = lent.running_file.as_ref().map(File::duplicate).transpose()?;
        Ok((file_struct, running_file))
    });
    FS_LOCK.release();
    (process.file_struct, process.running_file) = files?;
    Ok(process)
}

/// The first code a forked child runs.
fn bootstrap(pcb: Arc<ProcessControl>, loan: SharedLoan) {
    let lent = take(&loan);
    let copied = duplicate(&pcb, &lent);
    let mut regs = lent.regs;
    give_back(&loan, lent);
    drop(loan);

    match copied {
        Ok(process) => {
            regs.gprs.rax = 0;
            Current::attach_task(Box::new(process));
            pcb.fork_done.up();
            user::launch(regs)
        }
        Err(e) => {
            debug!("{}: fork failed to copy the parent: {e:?}.", pcb.name);
            let mut process = Process::new(pcb.clone());
            pcb.mark_fork_failed();
            pcb.fork_done.up();
            process.exit(-1)
        }
    }
}
