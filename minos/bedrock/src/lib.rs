//! The bedrock of the kernel: a simulated uniprocessor machine.
//!
//! This crate plays the role the hardware plays for a real kernel. It hosts
//! the kernel on top of the build machine and provides the handful of
//! facilities a uniprocessor kernel expects from its CPU:
//!
//! - [`cpu`]: execution contexts. Every kernel thread owns one context. A
//!   single CPU baton is passed between contexts so that exactly one of them
//!   executes kernel code at any time.
//! - [`interrupt`]: the interrupt flag, nested interrupt disabling with
//!   [`InterruptGuard`], interrupt-handler context and the deferred
//!   yield-on-return request. It also defines the user [`Registers`].
//! - [`spinlock`]: a [`SpinLock`] whose guard must be unlocked explicitly.
//! - [`kprint`]: the console (output capture, keyboard input) and the
//!   logging macros.
//! - [`addressing`]: virtual address arithmetic.
//! - [`machine`]: booting, idling, powering off and crashing the machine.
//!
//! You are **not** supposed to use the internals of this crate to build the
//! kernel. The `minos` crate re-exports everything the kernel needs.
//!
//! [`InterruptGuard`]: interrupt::InterruptGuard
//! [`Registers`]: interrupt::Registers
//! [`SpinLock`]: spinlock::SpinLock

#[doc(hidden)]
#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod cpu;
pub mod interrupt;
pub mod machine;
pub mod spinlock;

/// Maximum number of CPU the machine provides.
pub const MAX_CPU: usize = 1;
