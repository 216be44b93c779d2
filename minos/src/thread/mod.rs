//! Thread abstraction, an abstraction of a cpu core.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with their
//! own stack and local state. Threads are created with [`ThreadBuilder`],
//! block themselves with [`Current::park_with`] and are woken up through the
//! [`ParkHandle`] handed out while parking.
//!
//! Every live thread is registered in a thread table keyed by its [`Tid`].
//! Wait queues of synchronization primitives and the ready queue of the
//! scheduler hold shared handles to table entries; no queue owns a thread.
//!
//! ## Priority
//!
//! Each thread has a *base* priority in `PRI_MIN..=PRI_MAX` and an
//! *effective* priority that also accounts for the priorities donated by
//! threads waiting on locks it holds (see [`crate::sync::Lock`]). The
//! scheduler and every wait queue order threads by effective priority.
pub mod scheduler;

use crate::{KernelError, sync::LockId, task::Task};
use alloc::{boxed::Box, collections::btree_map::BTreeMap, sync::Arc, vec::Vec};
use arrayvec::ArrayString;
use bedrock::{cpu::Context, interrupt, spinlock::SpinLock};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crossbeam_utils::atomic::AtomicCell;
use scheduler::scheduler;

/// Lowest priority.
pub const PRI_MIN: i32 = 0;
/// Default priority.
pub const PRI_DEFAULT: i32 = 31;
/// Highest priority.
pub const PRI_MAX: i32 = 63;
/// Maximum length of a thread name in bytes.
pub const THREAD_NAME_MAX: usize = 16;

/// Thread identifier.
pub type Tid = u64;

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is runnable.
    Runnable,
    /// Thread is running.
    Running,
    /// Thread is exited with exitcode.
    Exited(i32),
    /// Thread is parked.
    Parked,
}

/// Priority bookkeeping of a thread.
#[derive(Debug, Clone)]
pub struct Priority {
    /// Priority set by the thread itself.
    pub base: i32,
    /// Priority the thread is scheduled with.
    ///
    /// Always `max(base, max of the donors' effective priority)`.
    pub effective: i32,
    /// Threads currently donating their priority to this thread.
    pub donations: Vec<Tid>,
    /// The lock this thread is blocked acquiring.
    pub waiting_on: Option<LockId>,
}

impl Priority {
    fn new(base: i32) -> Self {
        Self {
            base,
            effective: base,
            donations: Vec::new(),
            waiting_on: None,
        }
    }
}

struct ExitSlot {
    code: Option<i32>,
    joiners: Vec<ParkHandle>,
}

/// An thread abstraction.
pub struct Thread {
    /// Thread id
    pub tid: Tid,
    /// Thread name
    pub name: ArrayString<THREAD_NAME_MAX>,
    pub(crate) state: AtomicCell<ThreadState>,
    pub(crate) priority: SpinLock<Priority>,
    pub(crate) context: Context,
    pub(crate) task: SpinLock<Option<Box<dyn Task>>>,
    exit: Arc<SpinLock<ExitSlot>>,
}

impl Thread {
    /// Current state of the thread.
    pub fn state(&self) -> ThreadState {
        self.state.load()
    }

    /// Effective priority of the thread.
    pub fn priority(&self) -> i32 {
        let guard = self.priority.lock();
        let effective = guard.effective;
        guard.unlock();
        effective
    }

    /// Base priority of the thread.
    pub fn base_priority(&self) -> i32 {
        let guard = self.priority.lock();
        let base = guard.base;
        guard.unlock();
        base
    }

    /// The lock the thread is blocked acquiring.
    pub fn waiting_on(&self) -> Option<LockId> {
        let guard = self.priority.lock();
        let waiting_on = guard.waiting_on;
        guard.unlock();
        waiting_on
    }

    /// Donors currently lending their priority to the thread.
    pub fn donors(&self) -> Vec<Tid> {
        let guard = self.priority.lock();
        let donors = guard.donations.clone();
        guard.unlock();
        donors
    }

    /// Recomputes the effective priority from the base priority and the
    /// current donors.
    pub(crate) fn refresh_priority(&self) {
        let guard = self.priority.lock();
        let base = guard.base;
        let donors = guard.donations.clone();
        guard.unlock();

        let threads = THREADS.lock();
        let donated = donors
            .iter()
            .filter_map(|tid| threads.get(tid))
            .map(|donor| donor.priority())
            .max();
        threads.unlock();

        let mut guard = self.priority.lock();
        guard.effective = donated.map_or(base, |donated| donated.max(base));
        guard.unlock();
    }
}

static THREADS: SpinLock<BTreeMap<Tid, Arc<Thread>>> = SpinLock::new(BTreeMap::new());
static CURRENT: SpinLock<Option<Arc<Thread>>> = SpinLock::new(None);
static NEXT_TID: AtomicU64 = AtomicU64::new(0);
static LIVE_THREADS: AtomicUsize = AtomicUsize::new(0);
static MAX_THREADS: AtomicUsize = AtomicUsize::new(crate::DEFAULT_MAX_THREADS);

/// Resets the thread table for a freshly booted machine.
pub(crate) fn init(max_threads: usize) {
    let mut threads = THREADS.lock();
    // Threads of a previous machine stay parked forever.
    core::mem::forget(core::mem::take(&mut *threads));
    threads.unlock();
    let mut current = CURRENT.lock();
    core::mem::forget(current.take());
    current.unlock();
    NEXT_TID.store(0, Ordering::SeqCst);
    LIVE_THREADS.store(0, Ordering::SeqCst);
    MAX_THREADS.store(max_threads, Ordering::SeqCst);
}

/// Starts the first kernel thread of the machine.
pub(crate) fn start(main: Box<dyn FnOnce() + Send>) {
    let th = match ThreadBuilder::new("main").build(main) {
        Ok(th) => th,
        Err(e) => panic!("Failed to create the main thread: {e:?}"),
    };
    scheduler::run(th).resume();
}

fn set_current(th: Option<Arc<Thread>>) {
    let mut guard = CURRENT.lock();
    let prev = core::mem::replace(&mut *guard, th);
    guard.unlock();
    drop(prev);
}

/// Get the running thread.
pub(crate) fn current() -> Arc<Thread> {
    let guard = CURRENT.lock();
    let th = (*guard).clone();
    guard.unlock();
    match th {
        Some(th) => th,
        None => panic!("No thread is running on this CPU."),
    }
}

/// Run a function `f` with current thread as an argument.
pub fn with_current<R>(f: impl FnOnce(&Thread) -> R) -> R {
    f(&current())
}

/// Get a live thread by TID (Thread ID).
pub fn get(tid: Tid) -> Option<Arc<Thread>> {
    let threads = THREADS.lock();
    let th = threads.get(&tid).cloned();
    threads.unlock();
    th
}

/// Number of live threads.
pub fn live_threads() -> usize {
    LIVE_THREADS.load(Ordering::SeqCst)
}

/// Runs on the exiting thread once its stack is unwound.
fn retire(exit_code: i32) {
    let th = current();
    th.state.store(ThreadState::Exited(exit_code));

    let mut threads = THREADS.lock();
    threads.remove(&th.tid);
    threads.unlock();
    LIVE_THREADS.fetch_sub(1, Ordering::SeqCst);

    let mut slot = th.task.lock();
    let task = slot.take();
    slot.unlock();
    drop(task);

    let mut exit = th.exit.lock();
    exit.code = Some(exit_code);
    let joiners = core::mem::take(&mut exit.joiners);
    exit.unlock();
    for joiner in joiners {
        joiner.unpark();
    }

    debug!("Thread {} ({}) exited with {}.", th.tid, th.name, exit_code);
    drop(th);
    scheduler().retire();
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    name: ArrayString<THREAD_NAME_MAX>,
    priority: i32,
    task: Option<Box<dyn Task>>,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    ///
    /// Names longer than [`THREAD_NAME_MAX`] bytes are truncated.
    pub fn new(name: impl AsRef<str>) -> Self {
        let mut short = ArrayString::new();
        for c in name.as_ref().chars() {
            if short.try_push(c).is_err() {
                break;
            }
        }
        Self {
            name: short,
            priority: PRI_DEFAULT,
            task: None,
        }
    }

    /// Set the base priority of the thread.
    pub fn priority(mut self, priority: i32) -> Self {
        assert!(
            (PRI_MIN..=PRI_MAX).contains(&priority),
            "Invalid priority: {priority}"
        );
        self.priority = priority;
        self
    }

    /// Attach a task to the thread.
    pub fn attach_task(mut self, task: Box<dyn Task>) -> Self {
        self.task = Some(task);
        self
    }

    /// Spawn the thread as a parked state.
    ///
    /// The thread starts running `thread_fn` once it is scheduled. If the new
    /// thread outranks the current one, the current thread yields right away.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::NoMemory`] if the thread limit is reached or the
    /// machine cannot back another context.
    pub fn spawn<F>(self, thread_fn: F) -> Result<JoinHandle, KernelError>
    where
        F: FnOnce() + Send + 'static,
    {
        let th = self.build(Box::new(thread_fn))?;
        let handle = JoinHandle::new_for(&th);
        let priority = th.priority();
        debug!("Spawn thread {} ({}) at priority {}.", th.tid, th.name, priority);
        th.state.store(ThreadState::Runnable);
        scheduler().push_to_queue(th);
        Current::preempt_by(priority);
        Ok(handle)
    }

    fn build(self, entry: Box<dyn FnOnce() + Send>) -> Result<Arc<Thread>, KernelError> {
        let Self {
            name,
            priority,
            task,
        } = self;
        if LIVE_THREADS.fetch_add(1, Ordering::SeqCst) >= MAX_THREADS.load(Ordering::SeqCst) {
            LIVE_THREADS.fetch_sub(1, Ordering::SeqCst);
            warning!("Thread limit reached while spawning {name}.");
            return Err(KernelError::NoMemory);
        }
        let context = match Context::spawn(&name, entry, retire) {
            Ok(context) => context,
            Err(_) => {
                LIVE_THREADS.fetch_sub(1, Ordering::SeqCst);
                warning!("Machine refused a context for {name}.");
                return Err(KernelError::NoMemory);
            }
        };
        let th = Arc::new(Thread {
            tid: NEXT_TID.fetch_add(1, Ordering::SeqCst),
            name,
            state: AtomicCell::new(ThreadState::Parked),
            priority: SpinLock::new(Priority::new(priority)),
            context,
            task: SpinLock::new(task),
            exit: Arc::new(SpinLock::new(ExitSlot {
                code: None,
                joiners: Vec::new(),
            })),
        });
        let mut threads = THREADS.lock();
        threads.insert(th.tid, th.clone());
        threads.unlock();
        Ok(th)
    }
}

/// A handle to join thread.
pub struct JoinHandle {
    /// Thread id of this handle.
    pub tid: Tid,
    exit: Arc<SpinLock<ExitSlot>>,
}

impl JoinHandle {
    /// Make a join handle for Thread `th`.
    pub fn new_for(th: &Thread) -> Self {
        Self {
            tid: th.tid,
            exit: th.exit.clone(),
        }
    }

    /// Join this handle and returns exit code.
    pub fn join(self) -> i32 {
        loop {
            let mut guard = self.exit.lock();
            if let Some(code) = guard.code {
                guard.unlock();
                return code;
            }
            Current::park_with(move |handle| {
                guard.joiners.push(handle);
                guard.unlock();
            });
        }
    }
}

/// A handle that represent the parked thread.
pub struct ParkHandle {
    th: Arc<Thread>,
}

impl ParkHandle {
    /// Unpark the parked thread.
    ///
    /// The thread becomes runnable; it does not preempt the caller.
    pub fn unpark(self) {
        assert_eq!(
            self.th.state.swap(ThreadState::Runnable),
            ThreadState::Parked,
            "Unpark a thread that is not parked."
        );
        scheduler().push_to_queue(self.th);
    }

    /// Thread id of the parked thread.
    pub fn tid(&self) -> Tid {
        self.th.tid
    }

    /// Effective priority of the parked thread.
    pub fn priority(&self) -> i32 {
        self.th.priority()
    }
}

/// A struct to represent the currently running thread.
pub struct Current {
    _p: (),
}

impl Current {
    /// Get the current thread's id.
    pub fn get_tid() -> Tid {
        current().tid
    }

    /// Get the current thread's name.
    pub fn get_name() -> ArrayString<THREAD_NAME_MAX> {
        current().name
    }

    /// Park the current thread.
    ///
    /// `f` receives the [`ParkHandle`] of the thread and must store it where
    /// the waker finds it. The thread sleeps once `f` returns, until the
    /// handle is unparked.
    ///
    /// # Panics
    ///
    /// Panics if called from an interrupt handler, or if `f` returns while a
    /// spinlock is still held.
    pub fn park_with(f: impl FnOnce(ParkHandle)) {
        assert!(
            !interrupt::in_handler(),
            "Try to park a thread in an interrupt handler."
        );
        let th = current();
        let prev = th.state.swap(ThreadState::Parked);
        assert_eq!(prev, ThreadState::Running, "Park a thread that is not running.");
        f(ParkHandle { th });
        scheduler().reschedule();
    }

    /// Exit the current thread with `exit_code`.
    ///
    /// The stack of the thread is unwound: every value on it is dropped.
    pub fn exit(exit_code: i32) -> ! {
        assert!(
            !interrupt::InterruptGuard::is_guarded(),
            "Try to exit a thread while holding a lock."
        );
        bedrock::cpu::exit(exit_code)
    }

    /// Yield the CPU to another runnable thread.
    pub fn yield_now() {
        scheduler().reschedule();
    }

    /// Get the effective priority of the current thread.
    pub fn get_priority() -> i32 {
        current().priority()
    }

    /// Set the base priority of the current thread.
    ///
    /// Donations are preserved: the effective priority never drops below a
    /// donor's. Yields if a ready thread now outranks the current one.
    pub fn set_priority(priority: i32) {
        assert!(
            (PRI_MIN..=PRI_MAX).contains(&priority),
            "Invalid priority: {priority}"
        );
        let th = current();
        let mut guard = th.priority.lock();
        guard.base = priority;
        guard.unlock();
        th.refresh_priority();
        let effective = th.priority();
        drop(th);
        if scheduler()
            .highest_priority()
            .is_some_and(|top| top > effective)
        {
            Self::yield_now();
        }
    }

    /// Attach a task to the current thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread already runs a task.
    pub fn attach_task(task: Box<dyn Task>) {
        let th = current();
        let mut slot = th.task.lock();
        let occupied = slot.is_some();
        if !occupied {
            *slot = Some(task);
        }
        slot.unlock();
        assert!(!occupied, "Thread {} already has a task.", th.tid);
    }

    /// Gives up the CPU if a thread at `priority` outranks the current one.
    ///
    /// Inside an interrupt handler the yield is deferred until the handler
    /// returns.
    pub(crate) fn preempt_by(priority: i32) {
        if priority <= Self::get_priority() {
            return;
        }
        if interrupt::in_handler() {
            interrupt::yield_on_return();
        } else {
            Self::yield_now();
        }
    }
}
