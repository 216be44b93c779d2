//! Thread scheduler
use super::{Thread, ThreadState, current, set_current};
use alloc::{collections::VecDeque, sync::Arc};
use bedrock::{
    cpu::Context,
    interrupt::{self, InterruptGuard},
    spinlock::SpinLock,
};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Number of timer ticks a thread runs before it is preempted.
pub const TIME_SLICE: usize = 4;

/// A trait for a thread scheduler.
///
/// The [`Scheduler`] trait defines the common functionality expected from a
/// thread scheduler. It provides an interface for managing threads,
/// determining which thread to run next, and handling periodic timer
/// interrupts.
///
/// A scheduler only manages the ready queue. Parking, waking and context
/// switching are done by the kernel through [`reschedule`].
///
/// [`reschedule`]: #method.reschedule
pub trait Scheduler: Send + Sync {
    /// Pick a next thread to run.
    ///
    /// This method removes the next thread to run from the queue and returns
    /// it. If no threads are available, it returns `None`.
    fn next_to_run(&self) -> Option<Arc<Thread>>;

    /// Push a thread `th` into scheduling queue.
    fn push_to_queue(&self, th: Arc<Thread>);

    /// Called on every timer interrupt.
    ///
    /// Runs in the interrupt handler: to preempt the current thread, the
    /// scheduler requests a yield on return.
    fn timer_tick(&self);

    /// Effective priority of the best thread in the queue, if any.
    fn highest_priority(&self) -> Option<i32>;
}

static SCHEDULER: SpinLock<Option<Arc<dyn Scheduler>>> = SpinLock::new(None);

/// Set the scheduler of the kernel.
pub(crate) fn set_scheduler(scheduler: Arc<dyn Scheduler>) {
    let mut guard = SCHEDULER.lock();
    *guard = Some(scheduler);
    guard.unlock();
}

/// Get the kernel scheduler.
pub fn scheduler() -> Arc<dyn Scheduler> {
    let guard = SCHEDULER.lock();
    let scheduler = (*guard).clone();
    guard.unlock();
    match scheduler {
        Some(scheduler) => scheduler,
        None => panic!("Scheduler is not initialized."),
    }
}

/// Makes `th` the running thread and returns its context.
pub(super) fn run(th: Arc<Thread>) -> Context {
    th.state.store(ThreadState::Running);
    let context = th.context.clone();
    set_current(Some(th));
    context
}

impl dyn Scheduler {
    /// Reschedule the current thread.
    ///
    /// A running thread goes back to the ready queue; a parked thread stays
    /// off it until it is unparked. If nothing can run any more, the machine
    /// goes idle.
    pub fn reschedule(&self) {
        assert!(
            !InterruptGuard::is_guarded(),
            "Try to reschedule a thread while holding a lock."
        );
        assert!(
            !interrupt::in_handler(),
            "Try to reschedule a thread in an interrupt handler."
        );

        let prev = current();
        if prev
            .state
            .compare_exchange(ThreadState::Running, ThreadState::Runnable)
            .is_ok()
        {
            self.push_to_queue(prev.clone());
        }
        match self.next_to_run() {
            Some(next) if Arc::ptr_eq(&next, &prev) => {
                next.state.store(ThreadState::Running);
            }
            Some(next) => {
                let context = prev.context.clone();
                drop(prev);
                context.switch_to(&run(next));
            }
            None => {
                let context = prev.context.clone();
                drop(prev);
                set_current(None);
                bedrock::machine::idle();
                context.suspend();
            }
        }
    }

    /// Hands the CPU of an exited thread to the next runnable thread.
    pub(super) fn retire(&self) {
        match self.next_to_run() {
            Some(next) => run(next).resume(),
            None => {
                set_current(None);
                bedrock::machine::idle();
            }
        }
    }
}

/// A priority scheduler.
///
/// The thread with the highest effective priority runs first; threads of the
/// same priority run in round-robin order. A thread is preempted after
/// [`TIME_SLICE`] timer ticks.
pub struct PriorityScheduler {
    runqueue: SpinLock<VecDeque<Arc<Thread>>>,
    ticks: AtomicUsize,
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityScheduler {
    /// Create a new, empty priority scheduler.
    pub fn new() -> Self {
        Self {
            runqueue: SpinLock::new(VecDeque::new()),
            ticks: AtomicUsize::new(0),
        }
    }
}

fn best(queue: &VecDeque<Arc<Thread>>) -> Option<(usize, i32)> {
    queue
        .iter()
        .map(|th| th.priority())
        .enumerate()
        .fold(None, |best, (idx, priority)| match best {
            Some((_, top)) if top >= priority => best,
            _ => Some((idx, priority)),
        })
}

impl Scheduler for PriorityScheduler {
    fn next_to_run(&self) -> Option<Arc<Thread>> {
        let mut guard = self.runqueue.lock();
        let next = best(&guard).and_then(|(idx, _)| guard.remove(idx));
        guard.unlock();
        self.ticks.store(0, Ordering::SeqCst);
        next
    }

    fn push_to_queue(&self, th: Arc<Thread>) {
        let mut guard = self.runqueue.lock();
        guard.push_back(th);
        guard.unlock();
    }

    fn timer_tick(&self) {
        if self.ticks.fetch_add(1, Ordering::SeqCst) + 1 >= TIME_SLICE {
            interrupt::yield_on_return();
        }
    }

    fn highest_priority(&self) -> Option<i32> {
        let guard = self.runqueue.lock();
        let top = best(&guard).map(|(_, priority)| priority);
        guard.unlock();
        top
    }
}
