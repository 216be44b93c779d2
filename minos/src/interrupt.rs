//! Interrupt management.
//!
//! Devices of the simulated machine interrupt the running thread through
//! [`raise`]. A raised interrupt is delivered right away if interrupts are
//! enabled, and dropped otherwise. Handlers run with interrupts disabled and
//! must not block; a handler that wants the interrupted thread to give up the
//! CPU requests a yield, which is performed once the handler returns.
use crate::{sync::SpinLock, thread::Current};
use alloc::{collections::btree_map::BTreeMap, sync::Arc};
use bedrock::interrupt::{self, InterruptState};

/// Vector of the timer interrupt.
pub const TIMER_VECTOR: usize = 32;

type Handler = Arc<dyn Fn() + Send + Sync>;

static HANDLERS: SpinLock<BTreeMap<usize, Handler>> = SpinLock::new(BTreeMap::new());

pub(crate) fn init() {
    let mut handlers = HANDLERS.lock();
    handlers.clear();
    handlers.unlock();
}

/// Register a handler for interrupt vector `vec`.
///
/// A previously registered handler of the vector is replaced.
pub fn register(vec: usize, handler: impl Fn() + Send + Sync + 'static) {
    assert!(vec >= 32, "Invalid interrupt vector: {vec}");
    let mut handlers = HANDLERS.lock();
    handlers.insert(vec, Arc::new(handler));
    handlers.unlock();
}

/// Raise interrupt `vec` on the CPU.
///
/// Returns false if interrupts are disabled and the interrupt is lost.
///
/// # Panics
///
/// Panics on a vector without a handler.
pub fn raise(vec: usize) -> bool {
    if InterruptState::current() == InterruptState::Off {
        return false;
    }
    let handlers = HANDLERS.lock();
    let handler = handlers.get(&vec).cloned();
    handlers.unlock();

    match handler {
        Some(handler) => interrupt::enter_handler(|| handler()),
        None => panic!("Unknown interrupt #{vec}"),
    }
    if interrupt::take_yield_on_return() {
        Current::yield_now();
    }
    true
}

/// Raise the timer interrupt.
pub fn tick() -> bool {
    raise(TIMER_VECTOR)
}
