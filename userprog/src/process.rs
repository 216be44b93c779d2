//! # Process lifecycle.
//!
//! A process is described by two objects:
//!
//! - [`Process`]: the task attached to the thread of the process. It owns
//!   the resources that die with the program: the address space, the file
//!   descriptor table and the running executable.
//! - [`ProcessControl`]: the record kept in the process table. It outlives
//!   the thread until the parent has collected the exit status, and carries
//!   the links and semaphores of the parent/child protocol.
//!
//! ## Exit and wait
//!
//! Every process goes through the states
//!
//! ```text
//! Running --exit--> Zombie(status) --reaped--> Reaped
//! ```
//!
//! A process that exits prints `"<name>: exit(<status>)"`, orphans its
//! children, closes its files, and then, if it still has a parent, raises
//! `exit_signal` and sleeps on `teardown_permit` until the parent has read
//! its status. The parent collects a child with [`Process::wait`], which
//! waits for `exit_signal`, reads the status and grants `teardown_permit`.
//! A parent that exits first grants the permit to all of its children, so
//! orphans tear down on their own.
//!
//! A child can be waited for once; the second wait fails without blocking.
use crate::{FS_LOCK, file_struct::FileStruct, guard, syscall::SyscallAbi};
use alloc::{collections::btree_map::BTreeMap, sync::Arc, vec::Vec};
use arrayvec::ArrayString;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crossbeam_utils::atomic::AtomicCell;
use minos::{
    KernelError, debug,
    fs::{File, FileSystem},
    loader::{self, MAX_ARGS},
    mm::AddressSpace,
    println,
    sync::{Semaphore, SpinLock},
    thread::{Current, JoinHandle, THREAD_NAME_MAX, ThreadBuilder},
    user,
};

/// Process identifier.
pub type Pid = u64;

/// How a process terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// The process exited with a status code.
    Exited(i32),
    /// The process was created by a fork that failed to copy the parent.
    ForkFailed,
}

impl ExitStatus {
    /// The status code reported to the parent.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => code,
            ExitStatus::ForkFailed => -1,
        }
    }
}

/// State of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// The process runs.
    Running,
    /// The process terminated; its status is readable.
    Zombie(ExitStatus),
    /// The process is gone.
    Reaped,
}

/// The process control record.
pub struct ProcessControl {
    /// Process id.
    pub pid: Pid,
    /// Name printed in the termination message.
    pub name: ArrayString<THREAD_NAME_MAX>,
    parent: SpinLock<Option<Pid>>,
    children: SpinLock<Vec<Pid>>,
    lifecycle: AtomicCell<Lifecycle>,
    already_waited: AtomicBool,
    /// Raised once by a forked child when it is done copying its parent.
    pub fork_done: Semaphore,
    /// Raised by an exiting process that has a parent.
    pub exit_signal: Semaphore,
    /// Raised when the parent no longer needs the record.
    pub teardown_permit: Semaphore,
}

static PROCESSES: SpinLock<BTreeMap<Pid, Arc<ProcessControl>>> = SpinLock::new(BTreeMap::new());
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn init() {
    let mut processes = PROCESSES.lock();
    // Processes of a previous machine are parked forever.
    core::mem::forget(core::mem::take(&mut *processes));
    processes.unlock();
    NEXT_PID.store(1, Ordering::SeqCst);
}

/// Get a process record by pid.
pub fn get(pid: Pid) -> Option<Arc<ProcessControl>> {
    let processes = PROCESSES.lock();
    let pcb = processes.get(&pid).cloned();
    processes.unlock();
    pcb
}

/// Number of process records in the process table.
pub fn live_processes() -> usize {
    let processes = PROCESSES.lock();
    let len = processes.len();
    processes.unlock();
    len
}

impl ProcessControl {
    /// Creates a record and registers it in the process table and in the
    /// children of `parent`.
    pub fn new(name: &str, parent: Option<&ProcessControl>) -> Arc<Self> {
        let mut short = ArrayString::new();
        for c in name.chars() {
            if short.try_push(c).is_err() {
                break;
            }
        }
        let pcb = Arc::new(Self {
            pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
            name: short,
            parent: SpinLock::new(parent.map(|p| p.pid)),
            children: SpinLock::new(Vec::new()),
            lifecycle: AtomicCell::new(Lifecycle::Running),
            already_waited: AtomicBool::new(false),
            fork_done: Semaphore::new(0),
            exit_signal: Semaphore::new(0),
            teardown_permit: Semaphore::new(0),
        });
        let mut processes = PROCESSES.lock();
        processes.insert(pcb.pid, pcb.clone());
        processes.unlock();
        if let Some(parent) = parent {
            let mut children = parent.children.lock();
            children.push(pcb.pid);
            children.unlock();
        }
        pcb
    }

    /// Current state of the process.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.load()
    }

    /// Pid of the parent, unless the process is an orphan.
    pub fn parent(&self) -> Option<Pid> {
        let parent = self.parent.lock();
        let pid = *parent;
        parent.unlock();
        pid
    }

    /// Pids of the children not collected yet.
    pub fn children(&self) -> Vec<Pid> {
        let children = self.children.lock();
        let pids = children.clone();
        children.unlock();
        pids
    }

    /// Detaches the child `pid`. Returns false if it is not a child.
    pub(crate) fn remove_child(&self, pid: Pid) -> bool {
        let mut children = self.children.lock();
        let pos = children.iter().position(|child| *child == pid);
        if let Some(pos) = pos {
            children.remove(pos);
        }
        children.unlock();
        pos.is_some()
    }

    fn set_status(&self, status: ExitStatus) {
        self.lifecycle.store(Lifecycle::Zombie(status));
    }

    /// Marks a forked child that could not copy its parent.
    pub(crate) fn mark_fork_failed(&self) {
        self.set_status(ExitStatus::ForkFailed);
    }

    /// Takes the status of a terminated child and lets it tear down.
    ///
    /// Blocks until the child has terminated.
    pub(crate) fn collect(&self, parent: &ProcessControl) -> Result<i32, KernelError> {
        if self.already_waited.swap(true, Ordering::SeqCst) {
            return Err(KernelError::NoChild);
        }
        self.exit_signal.down();
        let status = match self.lifecycle() {
            Lifecycle::Zombie(status) => status,
            other => panic!("Collect process {} in state {other:?}.", self.pid),
        };
        parent.remove_child(self.pid);
        self.teardown_permit.up();
        Ok(status.code())
    }

    /// Drops the parent link and lets the process tear down on its own.
    fn orphan(&self) {
        let mut parent = self.parent.lock();
        *parent = None;
        parent.unlock();
        self.teardown_permit.up();
    }

    /// Removes the record from the process table.
    pub(crate) fn reap(&self) {
        self.lifecycle.store(Lifecycle::Reaped);
        let mut processes = PROCESSES.lock();
        let me = processes.remove(&self.pid);
        processes.unlock();
        drop(me);
    }
}

/// The task of a user process.
pub struct Process {
    /// The process control record.
    pub pcb: Arc<ProcessControl>,
    /// The file descriptor table.
    pub file_struct: FileStruct,
    /// The address space.
    pub address_space: AddressSpace,
    /// The executable the process runs. Writes to it are denied.
    pub running_file: Option<File>,
}

impl Process {
    /// Creates a process with an empty address space and no open file.
    pub fn new(pcb: Arc<ProcessControl>) -> Self {
        Self {
            pcb,
            file_struct: FileStruct::new(),
            address_space: AddressSpace::new(),
            running_file: None,
        }
    }

    /// Terminates the process with `status`.
    ///
    /// A process created by a failed fork keeps its failure status.
    pub fn exit(&mut self, status: i32) -> ! {
        let status = match self.pcb.lifecycle() {
            Lifecycle::Zombie(ExitStatus::ForkFailed) => ExitStatus::ForkFailed,
            _ => ExitStatus::Exited(status),
        };
        println!("{}: exit({})", self.pcb.name, status.code());
        self.pcb.set_status(status);

        let children = {
            let mut children = self.pcb.children.lock();
            let pids = core::mem::take(&mut *children);
            children.unlock();
            pids
        };
        for child in children.into_iter().filter_map(get) {
            child.orphan();
        }

        FS_LOCK.acquire();
        self.file_struct.close_all();
        drop(self.running_file.take());
        FS_LOCK.release();

        if self.pcb.parent().is_some() {
            self.pcb.exit_signal.up();
            self.pcb.teardown_permit.down();
        }
        self.address_space = AddressSpace::new();
        self.pcb.reap();
        Current::exit(status.code())
    }

    /// Waits for the child `arg1` and returns its exit status.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::NoChild`] if `arg1` is not a child of the
    /// process or was already waited for.
    pub fn wait(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let pid = abi.arg1 as Pid;
        if !self.pcb.children().contains(&pid) {
            return Err(KernelError::NoChild);
        }
        let child = get(pid).ok_or(KernelError::NoChild)?;
        child
            .collect(&self.pcb)
            .map(|code| code as isize as usize)
    }

    /// Replaces the program image with the command line at `arg1`.
    ///
    /// On success the registers are rewritten to enter the new image, which
    /// keeps the process name and the open files. On failure the process
    /// continues with its old image.
    pub fn exec(&mut self, abi: &mut SyscallAbi) -> Result<usize, KernelError> {
        let cmdline = guard::check_string(&self.address_space, abi.arg1)?;
        let argv = split_cmdline(&cmdline)?;

        FS_LOCK.acquire();
        let loaded = open_and_load(&argv);
        FS_LOCK.release();
        let (file, image) = loaded.inspect_err(|e| {
            debug!("{}: exec {cmdline} failed: {e:?}.", self.pcb.name);
        })?;

        self.address_space = image.address_space;
        FS_LOCK.acquire();
        drop(self.running_file.replace(file));
        FS_LOCK.release();
        *abi.regs = image.registers;
        Ok(0)
    }
}

fn split_cmdline(cmdline: &str) -> Result<Vec<&str>, KernelError> {
    let argv: Vec<&str> = cmdline.split_ascii_whitespace().collect();
    if argv.is_empty() || argv.len() > MAX_ARGS {
        return Err(KernelError::InvalidArgument);
    }
    Ok(argv)
}

/// Opens the executable `argv[0]`, denies writes to it and loads it.
fn open_and_load(argv: &[&str]) -> Result<(File, loader::Image), KernelError> {
    let mut file = FileSystem::open(argv[0])?;
    let image = loader::load(&mut file, argv)?;
    file.deny_write();
    Ok((file, image))
}

/// Starts the first user process with `cmdline`.
///
/// The process has no parent. Join the returned handle to get its exit
/// status.
pub fn run_initd(cmdline: &str) -> Result<JoinHandle, KernelError> {
    let argv = split_cmdline(cmdline)?;
    FS_LOCK.acquire();
    let loaded = open_and_load(&argv);
    FS_LOCK.release();
    let (file, image) = loaded?;

    let pcb = ProcessControl::new(argv[0], None);
    let mut process = Process::new(pcb.clone());
    process.address_space = image.address_space;
    process.running_file = Some(file);
    let regs = image.registers;
    ThreadBuilder::new(pcb.name)
        .attach_task(alloc::boxed::Box::new(process))
        .spawn(move || user::launch(regs))
        .inspect_err(|_| pcb.reap())
}
