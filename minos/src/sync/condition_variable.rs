//! # Condition Variable.
//!
//! A **Condition Variable** allows a thread to efficiently block until a
//! certain condition is met, without consuming CPU cycles. It is always used
//! with the [`Lock`] (or [`Mutex`]) that guards the shared state the
//! condition is about.
//!
//! MINOS condition variables are *Mesa-style*: signaling a waiter only makes
//! it runnable. By the time it reacquires the lock the state may have changed
//! again, so a waiter must re-check its condition in a loop:
//!
//! ```rust
//! lock.acquire();
//! while queue.is_empty() {
//!     not_empty.wait(&lock);
//! }
//! ```
//!
//! [`ConditionVariable::wait_while`] does this loop for a [`Mutex`]:
//!
//! ```rust
//! let guard = condvar.wait_while(&mutex, |state| state.is_empty());
//! ```
//!
//! Each waiter sleeps on a private [`Semaphore`]. Waiters are woken in order
//! of their effective priority at signal time.
use super::{Mutex, MutexGuard, SpinLock, lock::Lock, semaphore::Semaphore};
use crate::thread::{self, Tid};
use alloc::{sync::Arc, vec::Vec};
use bedrock::interrupt;
use core::cmp::Reverse;

/// Something that proves the monitor lock of a condition is held.
pub trait Monitor {
    /// The lock of the monitor.
    fn monitor_lock(&self) -> &Lock;
}

impl Monitor for Lock {
    fn monitor_lock(&self) -> &Lock {
        self
    }
}

impl<T> Monitor for MutexGuard<'_, T> {
    fn monitor_lock(&self) -> &Lock {
        self.mutex().raw()
    }
}

struct Waiter {
    tid: Tid,
    priority: i32,
    sema: Arc<Semaphore>,
}

/// A Condition Variable
#[derive(Default)]
pub struct ConditionVariable {
    waiters: SpinLock<Vec<Waiter>>,
}

impl ConditionVariable {
    /// Creates a new condition variable which is ready to be waited on and
    /// signaled.
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(Vec::new()),
        }
    }

    /// Atomically releases `lock` and waits to be signaled, then reacquires
    /// `lock` before returning.
    ///
    /// # Panics
    ///
    /// Panics if the current thread does not hold `lock` or runs an interrupt
    /// handler.
    pub fn wait(&self, lock: &Lock) {
        assert!(
            !interrupt::in_handler(),
            "ConditionVariable::wait in an interrupt handler."
        );
        assert!(
            lock.held_by_current(),
            "ConditionVariable::wait without holding the lock."
        );
        let me = thread::current();
        let sema = Arc::new(Semaphore::new(0));
        let waiter = Waiter {
            tid: me.tid,
            priority: me.priority(),
            sema: sema.clone(),
        };
        drop(me);

        let mut waiters = self.waiters.lock();
        let pos = waiters
            .iter()
            .position(|w| w.priority < waiter.priority)
            .unwrap_or(waiters.len());
        waiters.insert(pos, waiter);
        waiters.unlock();

        lock.release();
        sema.down();
        lock.acquire();
    }

    /// Blocks the current thread while `predicate` returns `true`.
    ///
    /// Locks `mutex`, and sleeps on this condition variable until the
    /// predicate on the protected data turns `false`. Returns the guard of
    /// the mutex.
    pub fn wait_while<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        let mut guard = mutex.lock();
        while predicate(&mut guard) {
            self.wait(mutex.raw());
        }
        guard
    }

    /// Wakes up the highest-priority waiter, if any.
    ///
    /// # Panics
    ///
    /// Panics if the current thread does not hold the monitor lock.
    pub fn signal(&self, monitor: &impl Monitor) {
        assert!(
            monitor.monitor_lock().held_by_current(),
            "ConditionVariable::signal without holding the lock."
        );
        let mut waiters = self.waiters.lock();
        for waiter in waiters.iter_mut() {
            if let Some(th) = thread::get(waiter.tid) {
                waiter.priority = th.priority();
            }
        }
        waiters.sort_by_key(|waiter| Reverse(waiter.priority));
        let front = if waiters.is_empty() {
            None
        } else {
            Some(waiters.remove(0))
        };
        waiters.unlock();

        if let Some(waiter) = front {
            waiter.sema.up();
        }
    }

    /// Wakes up all blocked threads on this condvar.
    ///
    /// # Panics
    ///
    /// Panics if the current thread does not hold the monitor lock.
    pub fn broadcast(&self, monitor: &impl Monitor) {
        while self.waiters() > 0 {
            self.signal(monitor);
        }
    }

    /// Number of threads waiting on the condition.
    pub fn waiters(&self) -> usize {
        let waiters = self.waiters.lock();
        let len = waiters.len();
        waiters.unlock();
        len
    }
}
