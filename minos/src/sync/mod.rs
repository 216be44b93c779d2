//! # Synchronization Primitives.
//!
//! An operating system kernel must coordinate access to shared resources
//! among multiple threads of execution. MINOS offers two families of
//! primitives:
//!
//! - [`SpinLock`]: busy-waits and disables interrupts while held. It protects
//!   short critical sections of the kernel, including the internal state of
//!   every other primitive below.
//! - Sleeping primitives, which park the waiting thread:
//!   - [`Semaphore`]: a counter with a priority-ordered wait queue; the
//!     foundation of the others.
//!   - [`Lock`]: a binary semaphore with an owner and priority donation.
//!   - [`ConditionVariable`]: Mesa-style monitor waits on top of a [`Lock`].
//!   - [`Mutex`]: a [`Lock`] bundled with the data it protects.
//!
//! | Primitive             | Blocks Thread? | Priority aware? | Typical Use Case                        |
//! |-----------------------|----------------|-----------------|-----------------------------------------|
//! | [`SpinLock`]          | No (busy wait) | No              | Short critical sections in the kernel   |
//! | [`Semaphore`]         | Yes            | Yes             | Signaling events, bounded resources     |
//! | [`Lock`]              | Yes            | Yes (donation)  | Exclusive ownership of a resource       |
//! | [`ConditionVariable`] | Yes            | Yes             | Waiting for a condition to become true  |
//!
//! None of the sleeping primitives may block inside an interrupt handler;
//! only [`Semaphore::up`] and [`Semaphore::try_down`] are safe there.
pub mod condition_variable;
pub mod lock;
pub mod mutex;
pub mod semaphore;

pub use bedrock::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
pub use condition_variable::{ConditionVariable, Monitor};
pub use lock::{DONATION_MAX_DEPTH, Lock, LockId};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;

/// Resets the lock ownership table for a freshly booted machine.
pub(crate) fn init() {
    lock::init();
}
