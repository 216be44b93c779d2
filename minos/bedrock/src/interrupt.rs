//! Interrupt state of the simulated CPU.
//!
//! The CPU has a single interrupt flag. Kernel code disables interrupts by
//! creating an [`InterruptGuard`]; guards nest and the flag is restored when
//! the outermost guard is dropped.
//!
//! Interrupts are delivered synchronously through [`enter_handler`]. While a
//! handler runs, [`in_handler`] reports `true`. A handler must never block;
//! if it wants the interrupted thread to give up the CPU, it calls
//! [`yield_on_return`] and the kernel performs the yield once the handler
//! has returned (see [`take_yield_on_return`]).
use core::{
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicIsize, Ordering},
};

static STATE: InterruptGuardInner = InterruptGuardInner::new();
static IN_HANDLER: AtomicBool = AtomicBool::new(false);
static YIELD_ON_RETURN: AtomicBool = AtomicBool::new(false);

struct InterruptGuardInner {
    enabled: AtomicBool,
    initial_state: AtomicBool,
    cnt: AtomicIsize,
}

impl InterruptGuardInner {
    const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            initial_state: AtomicBool::new(true),
            cnt: AtomicIsize::new(0),
        }
    }

    fn save_nested_interrupt_state(&self, state: InterruptState) {
        if self.cnt.fetch_add(1, Ordering::SeqCst) == 0 {
            self.initial_state
                .store(state == InterruptState::On, Ordering::SeqCst);
        }
    }

    fn load_nested_interrupt_state(&self) {
        let prev = self.cnt.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "Mismatched InterruptGuard drop calls: {prev}");

        if prev == 1 && self.initial_state.load(Ordering::SeqCst) {
            InterruptState::enable();
        }
    }
}

/// Enumeration representing the interrupt state.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Reads the current interrupt state.
    pub fn current() -> Self {
        if STATE.enabled.load(Ordering::SeqCst) {
            Self::On
        } else {
            Self::Off
        }
    }

    /// Sets the interrupt flag.
    pub fn enable() {
        STATE.enabled.store(true, Ordering::SeqCst);
    }

    /// Clears the interrupt flag.
    pub fn disable() {
        STATE.enabled.store(false, Ordering::SeqCst);
    }
}

/// An RAII-based guard for managing interrupt disabling.
///
/// When an `InterruptGuard` is created, interrupts are disabled. When it is
/// dropped, the interrupt state is restored to what it was before the
/// outermost guard was created.
///
/// Guards must be dropped in reverse order of their creation. Rust's scoping
/// rules uphold this unless a guard is dropped early by hand or stored in a
/// struct field.
pub struct InterruptGuard {
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Creates a new `InterruptGuard`, disabling interrupts.
    pub fn new() -> Self {
        let state = InterruptState::current();
        InterruptState::disable();
        STATE.save_nested_interrupt_state(state);
        Self {
            _not_send: PhantomData,
        }
    }

    /// Returns true if any guard is alive on the CPU.
    pub fn is_guarded() -> bool {
        STATE.cnt.load(Ordering::SeqCst) > 0
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        STATE.load_nested_interrupt_state();
    }
}

/// Runs `f` as an interrupt handler.
///
/// Interrupts stay disabled while the handler runs. Handlers do not nest.
pub fn enter_handler<R>(f: impl FnOnce() -> R) -> R {
    assert!(
        !IN_HANDLER.swap(true, Ordering::SeqCst),
        "Nested interrupt handler."
    );
    let guard = InterruptGuard::new();
    let r = f();
    drop(guard);
    IN_HANDLER.store(false, Ordering::SeqCst);
    r
}

/// Returns true while an interrupt handler is running.
pub fn in_handler() -> bool {
    IN_HANDLER.load(Ordering::SeqCst)
}

/// Requests a yield of the interrupted thread once the running handler
/// returns.
pub fn yield_on_return() {
    assert!(in_handler(), "yield_on_return outside of an interrupt handler.");
    YIELD_ON_RETURN.store(true, Ordering::SeqCst);
}

/// Consumes a pending yield-on-return request.
pub fn take_yield_on_return() -> bool {
    YIELD_ON_RETURN.swap(false, Ordering::SeqCst)
}

/// Resets the interrupt state for a freshly booted machine.
pub(crate) fn reset() {
    STATE.enabled.store(true, Ordering::SeqCst);
    STATE.initial_state.store(true, Ordering::SeqCst);
    STATE.cnt.store(0, Ordering::SeqCst);
    IN_HANDLER.store(false, Ordering::SeqCst);
    YIELD_ON_RETURN.store(false, Ordering::SeqCst);
}

bitflags::bitflags! {
    /// The RFLAGS register.
    pub struct Rflags: usize {
        /// Reserved, always one.
        const _1 = 1 << 1;
        /// Interrupt enable flag.
        const IF = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Error code delivered with a page fault.
    pub struct PFErrorCode: usize {
        /// The fault was caused by a protection violation, not a missing page.
        const PRESENT = 1 << 0;
        /// The access causing the fault was a write.
        const WRITE_ACCESS = 1 << 1;
        /// The access originated from user mode.
        const USER = 1 << 2;
        /// The fault was caused by an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// X86_64's general purpose registers.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GeneralPurposeRegisters {
    /// R15 register.
    pub r15: usize,
    /// R14 register.
    pub r14: usize,
    /// R13 register.
    pub r13: usize,
    /// R12 register.
    pub r12: usize,
    /// R11 register.
    pub r11: usize,
    /// R10 register.
    pub r10: usize,
    /// R9 register.
    pub r9: usize,
    /// R8 register.
    pub r8: usize,
    /// RSI register.
    pub rsi: usize,
    /// RDI register.
    pub rdi: usize,
    /// RBP register.
    pub rbp: usize,
    /// RDX register.
    pub rdx: usize,
    /// RCX register.
    pub rcx: usize,
    /// RBX register.
    pub rbx: usize,
    /// RAX register.
    pub rax: usize,
}

/// The user-mode register file.
///
/// A snapshot of this structure is everything needed to resume a user
/// program: the general purpose registers, the instruction pointer and the
/// stack pointer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Registers {
    /// General purpose registers.
    pub gprs: GeneralPurposeRegisters,
    rip: usize,
    rsp: usize,
    rflags: Rflags,
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Registers {
    /// Creates a new register frame for a user thread.
    ///
    /// ```rust
    /// let mut regs = Registers::new();
    /// *regs.rip() = 0x400000; // Set entry point
    /// *regs.rsp() = 0x4748_0000; // Set user stack pointer
    /// ```
    #[inline]
    pub fn new() -> Self {
        Self {
            gprs: GeneralPurposeRegisters::default(),
            rip: 0,
            rsp: 0,
            rflags: Rflags::IF | Rflags::_1,
        }
    }

    /// Returns a mutable reference to the instruction pointer (`RIP`).
    pub fn rip(&mut self) -> &mut usize {
        &mut self.rip
    }

    /// Returns a mutable reference to the stack pointer (`RSP`).
    pub fn rsp(&mut self) -> &mut usize {
        &mut self.rsp
    }

    /// Reads the instruction pointer.
    pub fn ip(&self) -> usize {
        self.rip
    }

    /// Reads the stack pointer.
    pub fn sp(&self) -> usize {
        self.rsp
    }
}

impl core::fmt::Debug for Registers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        write!(
            f,
            "RAX: {:016x} | RBX: {:016x}  | RCX: {:016x} | RDX: {:016x}\n\
             RSI: {:016x} | RDI: {:016x}  | RBP: {:016x} | RSP: {:016x}\n\
             R8 : {:016x} | R9 : {:016x}  | R10: {:016x} | R11: {:016x}\n\
             R12: {:016x} | R13: {:016x}  | R14: {:016x} | R15: {:016x}\n\
             RIP: {:016x} | RFLAGS: {:016x} [{:?}]",
            self.gprs.rax,
            self.gprs.rbx,
            self.gprs.rcx,
            self.gprs.rdx,
            self.gprs.rsi,
            self.gprs.rdi,
            self.gprs.rbp,
            self.rsp,
            self.gprs.r8,
            self.gprs.r9,
            self.gprs.r10,
            self.gprs.r11,
            self.gprs.r12,
            self.gprs.r13,
            self.gprs.r14,
            self.gprs.r15,
            self.rip,
            self.rflags.bits(),
            self.rflags,
        )
    }
}
