//! User-mode execution.
//!
//! User programs are host closures (see [`crate::loader`]) that run on the
//! kernel thread of their process. A program sees the machine only through
//! its [`UserContext`]: the register file, loads and stores checked against
//! the process address space, and the `syscall` instruction.
//!
//! Any load or store that touches an inaccessible address raises a page
//! fault, which the task of the thread turns into the termination of the
//! process.
//!
//! ## Forking
//!
//! A forked child resumes at the instruction after the `syscall` with `rax`
//! set to 0. Since a closure cannot be resumed halfway, a program that forks
//! uses [`UserContext::syscall_forking`] and passes the code the child runs
//! from that point on. The `syscall` is issued from a private text address
//! and the code is published at its return address, so the register snapshot
//! the kernel hands to the child leads [`launch`] right to it.
use crate::{
    KernelError,
    loader::{self, DATA_BASE, DATA_PAGES},
    sync::SpinLock,
    task::{PFErrorCode, kill_current_thread, with_current_task},
};
use alloc::{boxed::Box, collections::btree_map::BTreeMap, string::String, vec::Vec};
use bedrock::{
    addressing::{PAGE_SIZE, Va},
    interrupt::Registers,
};
use core::sync::atomic::{AtomicUsize, Ordering};

/// The system call that receives the return value of a program.
pub const SYS_EXIT: usize = 1;

/// Length of the `syscall` instruction. The kernel returns to the
/// instruction that follows it.
const SYSCALL_INSN_LEN: usize = 2;

/// Text addresses handed out to fork continuations.
const CONTINUATION_BASE: usize = 0x1000_0000;

type Continuation = Box<dyn FnOnce(&mut UserContext) -> i32 + Send>;

static CONTINUATIONS: SpinLock<BTreeMap<usize, Continuation>> = SpinLock::new(BTreeMap::new());
static NEXT_CONTINUATION: AtomicUsize = AtomicUsize::new(CONTINUATION_BASE);

pub(crate) fn init() {
    let mut continuations = CONTINUATIONS.lock();
    let old = core::mem::take(&mut *continuations);
    continuations.unlock();
    drop(old);
    NEXT_CONTINUATION.store(CONTINUATION_BASE, Ordering::SeqCst);
}

fn take_continuation(rip: usize) -> Option<Continuation> {
    let mut continuations = CONTINUATIONS.lock();
    let continuation = continuations.remove(&rip);
    continuations.unlock();
    continuation
}

/// Number of fork continuations that no child has picked up yet.
pub fn pending_continuations() -> usize {
    let continuations = CONTINUATIONS.lock();
    let len = continuations.len();
    continuations.unlock();
    len
}

/// The view a user program has of the machine.
pub struct UserContext {
    /// The register file.
    pub regs: Registers,
    entry: Registers,
}

impl UserContext {
    fn new(regs: Registers) -> Self {
        Self { regs, entry: regs }
    }

    /// Executes the `syscall` instruction.
    ///
    /// Returns `rax` after the kernel served the call. The kernel resumes the
    /// program at the instruction after `syscall`; if it resumes anywhere
    /// else, the program image was replaced and the call never returns.
    pub fn syscall(&mut self, nr: usize, args: [usize; 6]) -> isize {
        let [a1, a2, a3, a4, a5, a6] = args;
        let gprs = &mut self.regs.gprs;
        gprs.rax = nr;
        gprs.rdi = a1;
        gprs.rsi = a2;
        gprs.rdx = a3;
        gprs.r10 = a4;
        gprs.r8 = a5;
        gprs.r9 = a6;

        let rip = self.regs.ip();
        let next = rip + SYSCALL_INSN_LEN;
        *self.regs.rip() = next;
        crate::syscall::do_handle_syscall(&mut self.regs);
        if self.regs.ip() != next {
            launch(self.regs);
        }
        *self.regs.rip() = rip;
        self.regs.gprs.rax as isize
    }

    /// Executes a `syscall` instruction that may fork the process.
    ///
    /// The child created by the call runs `child` and exits with its return
    /// value; the parent gets the result of the call.
    pub fn syscall_forking(
        &mut self,
        nr: usize,
        args: [usize; 6],
        child: impl FnOnce(&mut UserContext) -> i32 + Send + 'static,
    ) -> isize {
        let text = NEXT_CONTINUATION.fetch_add(16, Ordering::SeqCst);
        let resume = text + SYSCALL_INSN_LEN;
        let mut continuations = CONTINUATIONS.lock();
        continuations.insert(resume, Box::new(child));
        continuations.unlock();

        let rip = core::mem::replace(self.regs.rip(), text);
        let r = self.syscall(nr, args);
        *self.regs.rip() = rip;
        if r < 0 {
            drop(take_continuation(resume));
        }
        r
    }

    /// Command line arguments the program was started with.
    pub fn args(&self) -> Vec<String> {
        let argc = self.entry.gprs.rdi;
        let argv = self.entry.gprs.rsi;
        (0..argc)
            .map(|i| {
                let ptr = self.load_u64(argv + i * 8) as usize;
                self.load_cstr(ptr)
            })
            .collect()
    }

    /// Loads `buf.len()` bytes at `va`.
    pub fn load(&self, va: usize, buf: &mut [u8]) {
        let r = with_current_task(|task| {
            let range = range_of(va, buf.len())?;
            if !task.access_ok(range.clone(), false) {
                return Err(KernelError::BadAddress);
            }
            task.address_space()
                .ok_or(KernelError::BadAddress)?
                .read(range.start, buf)
        });
        if !matches!(r, Some(Ok(()))) {
            fault(va, false);
        }
    }

    /// Loads a little-endian u64 at `va`.
    pub fn load_u64(&self, va: usize) -> u64 {
        let mut bytes = [0; 8];
        self.load(va, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    /// Loads the NUL-terminated string at `va`.
    pub fn load_cstr(&self, va: usize) -> String {
        let mut bytes = Vec::new();
        let mut at = va;
        loop {
            let mut b = [0];
            self.load(at, &mut b);
            if b[0] == 0 {
                return String::from_utf8_lossy(&bytes).into_owned();
            }
            bytes.push(b[0]);
            at += 1;
        }
    }

    /// Stores `data` at `va`.
    pub fn store(&mut self, va: usize, data: &[u8]) {
        let r = with_current_task(|task| {
            let range = range_of(va, data.len())?;
            if !task.access_ok(range.clone(), true) {
                return Err(KernelError::BadAddress);
            }
            task.address_space_mut()
                .ok_or(KernelError::BadAddress)?
                .write(range.start, data)
        });
        if !matches!(r, Some(Ok(()))) {
            fault(va, true);
        }
    }

    /// Stores a little-endian u64 at `va`.
    pub fn store_u64(&mut self, va: usize, v: u64) {
        self.store(va, &v.to_le_bytes());
    }

    /// Allocates `len` bytes in the data region and returns their address.
    ///
    /// Allocations are 8-byte aligned and never freed. Running past the end
    /// of the data region faults.
    pub fn alloc(&mut self, len: usize) -> usize {
        let cursor = self.load_u64(DATA_BASE) as usize;
        let end = DATA_BASE + DATA_PAGES * PAGE_SIZE;
        let next = (cursor + len + 7) & !7;
        if next > end {
            fault(end, true);
        }
        self.store_u64(DATA_BASE, next as u64);
        cursor
    }

    /// Copies `data` into the data region and returns its address.
    pub fn push_bytes(&mut self, data: &[u8]) -> usize {
        let va = self.alloc(data.len());
        self.store(va, data);
        va
    }

    /// Copies `s` with a NUL terminator into the data region and returns its
    /// address.
    pub fn push_cstr(&mut self, s: &str) -> usize {
        let va = self.alloc(s.len() + 1);
        self.store(va, s.as_bytes());
        self.store(va + s.len(), &[0]);
        va
    }
}

fn range_of(va: usize, len: usize) -> Result<core::ops::Range<Va>, KernelError> {
    let start = Va::new(va).ok_or(KernelError::BadAddress)?;
    let end = start.checked_add(len).ok_or(KernelError::BadAddress)?;
    Ok(start..end)
}

/// Raises a user page fault at `va`.
fn fault(va: usize, write: bool) -> ! {
    let mut ec = PFErrorCode::USER;
    if write {
        ec |= PFErrorCode::WRITE_ACCESS;
    }
    fault_with(ec, va)
}

fn fault_with(mut ec: PFErrorCode, va: usize) -> ! {
    let va = Va::new(va).unwrap_or_default();
    with_current_task::<()>(|task| {
        if task.address_space().is_some_and(|aspace| aspace.is_mapped(va)) {
            ec |= PFErrorCode::PRESENT;
        }
        task.page_fault(ec, va)
    });
    kill_current_thread()
}

/// Starts executing user code with the register file `regs`.
///
/// Runs the fork continuation or the program at `rip` and passes its return
/// value to [`SYS_EXIT`]. Jumping to an address without code faults.
pub fn launch(regs: Registers) -> ! {
    let mut ctx = UserContext::new(regs);
    let code = match take_continuation(ctx.regs.ip()) {
        Some(continuation) => continuation(&mut ctx),
        None => {
            let rip = ctx.regs.ip();
            let Some(program) = fetch(rip) else {
                fault_with(PFErrorCode::USER | PFErrorCode::INSTRUCTION_FETCH, rip)
            };
            program(&mut ctx)
        }
    };
    ctx.syscall(SYS_EXIT, [code as usize, 0, 0, 0, 0, 0]);
    kill_current_thread()
}

/// Decodes the program whose header sits at `rip`.
fn fetch(rip: usize) -> Option<loader::Program> {
    let start = Va::new(rip)?;
    let mut header = alloc::vec![0u8; PAGE_SIZE - start.offset()];
    let ok = with_current_task(|task| {
        task.access_ok(start..start, false)
            && task
                .address_space()
                .is_some_and(|aspace| aspace.read(start, &mut header).is_ok())
    })?;
    if !ok {
        return None;
    }
    loader::lookup(loader::parse_header(&header)?)
}
