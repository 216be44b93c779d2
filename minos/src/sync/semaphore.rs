//! # Semaphore.
//!
//! A **semaphore** is a nonnegative counter with two atomic operations:
//!
//! - [`Semaphore::down`]: waits for the counter to become positive, then
//!   decrements it.
//! - [`Semaphore::up`]: increments the counter and wakes up one waiter, if
//!   any.
//!
//! A semaphore initialized to zero is an event: one thread downs it to wait
//! for the event and another ups it when the event happens. A semaphore
//! initialized to one is a lock without an owner.
//!
//! ## Ordering
//!
//! Waiters are released in order of their effective priority, highest first,
//! and in arrival order among equals. Because a waiter may receive a priority
//! donation while it sleeps, the queue is re-sorted each time a waiter is
//! picked.
//!
//! ## Hand-off
//!
//! When [`Semaphore::up`] finds a waiter, the unit is handed to that waiter
//! directly: the counter does not become visible to other threads, so a
//! woken waiter never finds the counter already taken by a thread that ran
//! in between.
use super::SpinLock;
use crate::thread::{Current, ParkHandle, Tid};
use alloc::{sync::Arc, vec::Vec};
use bedrock::interrupt;
use core::{
    cmp::Reverse,
    sync::atomic::{AtomicBool, Ordering},
};

struct Waiter {
    handle: ParkHandle,
    granted: Arc<AtomicBool>,
}

struct SemaphoreInner {
    count: usize,
    waiters: Vec<Waiter>,
}

/// Counting semaphore.
pub struct Semaphore {
    inner: SpinLock<SemaphoreInner>,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Semaphore {
    /// Creates a new semaphore with `value` units.
    pub const fn new(value: usize) -> Self {
        Self {
            inner: SpinLock::new(SemaphoreInner {
                count: value,
                waiters: Vec::new(),
            }),
        }
    }

    /// Resets the semaphore to `value` units and forgets every waiter.
    pub fn init(&self, value: usize) {
        let mut guard = self.inner.lock();
        guard.count = value;
        guard.waiters.clear();
        guard.unlock();
    }

    /// Waits for the counter to become positive and decrements it.
    ///
    /// # Panics
    ///
    /// Panics if called from an interrupt handler.
    pub fn down(&self) {
        assert!(
            !interrupt::in_handler(),
            "Semaphore::down in an interrupt handler."
        );
        let granted = Arc::new(AtomicBool::new(false));
        loop {
            let mut guard = self.inner.lock();
            if guard.count > 0 {
                guard.count -= 1;
                guard.unlock();
                return;
            }
            let ticket = granted.clone();
            Current::park_with(move |handle| {
                let priority = handle.priority();
                let pos = guard
                    .waiters
                    .iter()
                    .position(|waiter| waiter.handle.priority() < priority)
                    .unwrap_or(guard.waiters.len());
                guard.waiters.insert(
                    pos,
                    Waiter {
                        handle,
                        granted: ticket,
                    },
                );
                guard.unlock();
            });
            if granted.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Decrements the counter if it is positive.
    ///
    /// Returns `true` on success. Never blocks, so it is safe to call from an
    /// interrupt handler.
    pub fn try_down(&self) -> bool {
        let mut guard = self.inner.lock();
        let success = guard.count > 0;
        if success {
            guard.count -= 1;
        }
        guard.unlock();
        success
    }

    /// Increments the counter and wakes up the highest-priority waiter.
    ///
    /// If the woken thread outranks the caller, the caller yields; inside an
    /// interrupt handler the yield is deferred until the handler returns.
    pub fn up(&self) {
        self.up_then(|_| {});
    }

    /// Like [`Semaphore::up`], but first calls `on_grant` with the thread the
    /// unit is handed to, or `None` if nobody was waiting.
    ///
    /// `on_grant` runs before the woken thread becomes runnable.
    pub(super) fn up_then(&self, on_grant: impl FnOnce(Option<Tid>)) {
        let mut guard = self.inner.lock();
        let woken = if guard.waiters.is_empty() {
            guard.count += 1;
            None
        } else {
            guard
                .waiters
                .sort_by_key(|waiter| Reverse(waiter.handle.priority()));
            Some(guard.waiters.remove(0))
        };
        guard.unlock();

        on_grant(woken.as_ref().map(|waiter| waiter.handle.tid()));
        if let Some(Waiter { handle, granted }) = woken {
            let priority = handle.priority();
            granted.store(true, Ordering::SeqCst);
            handle.unpark();
            Current::preempt_by(priority);
        }
    }

    /// Current value of the counter.
    pub fn value(&self) -> usize {
        let guard = self.inner.lock();
        let count = guard.count;
        guard.unlock();
        count
    }

    /// Number of threads blocked on the semaphore.
    pub fn waiters(&self) -> usize {
        let guard = self.inner.lock();
        let len = guard.waiters.len();
        guard.unlock();
        len
    }
}
