//! # Lock with priority donation.
//!
//! A [`Lock`] is a binary semaphore with an owner: only the thread that
//! acquired it may release it, and a thread must not acquire a lock it
//! already holds.
//!
//! ## Priority donation
//!
//! A high-priority thread blocked on a lock held by a low-priority thread
//! would otherwise wait for every medium-priority thread that preempts the
//! holder (*priority inversion*). To avoid this, the waiter lends its
//! effective priority to the holder:
//!
//! 1. The waiter records the lock in its `waiting_on` and joins the holder's
//!    donor list.
//! 2. The holder's effective priority is raised to the waiter's, and so on
//!    up the chain of holders that are themselves blocked on another lock,
//!    for at most [`DONATION_MAX_DEPTH`] hops.
//! 3. On release, the holder drops every donor that was waiting for this
//!    lock and recomputes its effective priority from the remaining donors.
//!    The lock passes to the best waiter, which becomes the holder before
//!    it runs and takes the other waiters as donors.
//!
//! The depth bound keeps the walk finite on accidentally cyclic wait graphs;
//! it is not a deadlock detector.
use super::{SpinLock, semaphore::Semaphore};
use crate::thread::{self, Current, Tid};
use alloc::{collections::btree_map::BTreeMap, vec::Vec};
use bedrock::interrupt::{self, InterruptGuard};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Maximum number of holders a donation propagates through.
pub const DONATION_MAX_DEPTH: usize = 8;

/// Identity of a [`Lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockId(usize);

static NEXT_LOCK_ID: AtomicUsize = AtomicUsize::new(1);
static HOLDERS: SpinLock<BTreeMap<LockId, Tid>> = SpinLock::new(BTreeMap::new());

pub(super) fn init() {
    let mut holders = HOLDERS.lock();
    holders.clear();
    holders.unlock();
}

fn holder_of(id: LockId) -> Option<Tid> {
    let holders = HOLDERS.lock();
    let holder = holders.get(&id).copied();
    holders.unlock();
    holder
}

fn set_holder(id: LockId, holder: Option<Tid>) {
    let mut holders = HOLDERS.lock();
    match holder {
        Some(tid) => holders.insert(id, tid),
        None => holders.remove(&id),
    };
    holders.unlock();
}

/// A sleeping mutual-exclusion lock with priority donation.
///
/// Unlike [`Mutex`], a lock does not own the data it protects.
///
/// [`Mutex`]: super::Mutex
pub struct Lock {
    id: AtomicUsize,
    sema: Semaphore,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    /// Creates a new lock in an unlocked state.
    pub const fn new() -> Self {
        Self {
            id: AtomicUsize::new(0),
            sema: Semaphore::new(1),
        }
    }

    /// Resets the lock to the unlocked state and forgets every waiter.
    pub fn init(&self) {
        set_holder(self.id(), None);
        self.sema.init(1);
    }

    /// Identity of the lock, assigned on first use.
    pub fn id(&self) -> LockId {
        let id = self.id.load(Ordering::SeqCst);
        if id != 0 {
            return LockId(id);
        }
        let fresh = NEXT_LOCK_ID.fetch_add(1, Ordering::SeqCst);
        match self
            .id
            .compare_exchange(0, fresh, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => LockId(fresh),
            Err(id) => LockId(id),
        }
    }

    /// The thread holding the lock.
    pub fn holder(&self) -> Option<Tid> {
        holder_of(self.id())
    }

    /// Returns true if the current thread holds the lock.
    pub fn held_by_current(&self) -> bool {
        self.holder() == Some(Current::get_tid())
    }

    /// Acquires the lock, sleeping until it becomes available.
    ///
    /// While sleeping, the current thread donates its priority to the holder
    /// chain.
    ///
    /// # Panics
    ///
    /// Panics if called from an interrupt handler or if the current thread
    /// already holds the lock.
    pub fn acquire(&self) {
        assert!(
            !interrupt::in_handler(),
            "Lock::acquire in an interrupt handler."
        );
        let id = self.id();
        let me = thread::current();
        let holder = holder_of(id);
        assert_ne!(
            holder,
            Some(me.tid),
            "Thread {} acquires a lock it already holds.",
            me.tid
        );

        if let Some(holder) = holder {
            let _guard = InterruptGuard::new();
            let mut priority = me.priority.lock();
            priority.waiting_on = Some(id);
            let donation = priority.effective;
            priority.unlock();
            donate(me.tid, donation, holder);
        }

        self.sema.down();

        set_holder(id, Some(me.tid));
        let mut priority = me.priority.lock();
        priority.waiting_on = None;
        priority.unlock();
    }

    /// Acquires the lock if it is free, without sleeping or donating.
    ///
    /// # Panics
    ///
    /// Panics if the current thread already holds the lock.
    pub fn try_acquire(&self) -> bool {
        let id = self.id();
        let me = Current::get_tid();
        assert_ne!(
            holder_of(id),
            Some(me),
            "Thread {me} acquires a lock it already holds."
        );
        let success = self.sema.try_down();
        if success {
            set_holder(id, Some(me));
        }
        success
    }

    /// Releases the lock.
    ///
    /// The current thread gives back every donation it received through this
    /// lock and yields if its priority dropped.
    ///
    /// # Panics
    ///
    /// Panics if the current thread does not hold the lock.
    pub fn release(&self) {
        let id = self.id();
        let me = thread::current();
        assert_eq!(
            holder_of(id),
            Some(me.tid),
            "Thread {} releases a lock it does not hold.",
            me.tid
        );

        let (before, waiters) = {
            let _guard = InterruptGuard::new();
            let before = me.priority();
            let priority = me.priority.lock();
            let donors = priority.donations.clone();
            priority.unlock();

            let (waiters, remaining): (Vec<_>, Vec<_>) = donors.into_iter().partition(|donor| {
                thread::get(*donor).is_some_and(|th| th.waiting_on() == Some(id))
            });

            let mut priority = me.priority.lock();
            priority.donations = remaining;
            priority.unlock();
            me.refresh_priority();
            set_holder(id, None);
            (before, waiters)
        };

        self.sema.up_then(|next| {
            if let Some(next) = next {
                hand_over(id, next, &waiters);
            }
        });

        if me.priority() < before && !interrupt::in_handler() {
            drop(me);
            Current::yield_now();
        }
    }
}

/// Makes `next` the holder of the lock `id` before it gets to run.
///
/// The threads still waiting for the lock become donors of the new holder.
fn hand_over(id: LockId, next: Tid, waiters: &[Tid]) {
    let _guard = InterruptGuard::new();
    set_holder(id, Some(next));
    let Some(th) = thread::get(next) else {
        return;
    };
    let mut state = th.priority.lock();
    state.waiting_on = None;
    for waiter in waiters.iter().filter(|waiter| **waiter != next) {
        if !state.donations.contains(waiter) {
            state.donations.push(*waiter);
        }
    }
    state.unlock();
    th.refresh_priority();
}

/// Lends `priority` of `donor` to `holder` and up its wait chain.
fn donate(donor: Tid, priority: i32, holder: Tid) {
    let mut next = Some(holder);
    for depth in 0..DONATION_MAX_DEPTH {
        let Some(th) = next.and_then(thread::get) else {
            return;
        };
        let mut state = th.priority.lock();
        if depth == 0 && !state.donations.contains(&donor) {
            state.donations.push(donor);
        }
        if state.effective < priority {
            state.effective = priority;
        }
        let waiting_on = state.waiting_on;
        state.unlock();
        next = waiting_on.and_then(holder_of);
    }
}
