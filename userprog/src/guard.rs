//! Boundary guard.
//!
//! A system call argument that names user memory is checked here before the
//! kernel touches a single byte of it. Every check fails with
//! [`KernelError::BadAddress`], which the system call dispatcher turns into
//! the termination of the calling process with status `-1`.
//!
//! An address is valid when it is not null, lies below `KERNEL_BASE` and is
//! mapped in the address space of the caller with user access.
use minos::{
    KernelError,
    addressing::Va,
    mm::AddressSpace,
    syscall::uaccess::{UserCString, UserPtrRO, UserU8SliceRO, UserU8SliceWO},
};
use alloc::string::String;

/// Checks that the byte at `addr` is readable by the user.
pub fn check_pointer(aspace: &AddressSpace, addr: usize) -> Result<Va, KernelError> {
    UserPtrRO::<u8>::new(addr).get(aspace)?;
    Va::new(addr).ok_or(KernelError::BadAddress)
}

/// Checks every page spanned by `[addr, addr + len)`.
///
/// With `write`, the range must also be writable. The start address is
/// checked even when `len` is zero.
pub fn check_buffer(
    aspace: &AddressSpace,
    addr: usize,
    len: usize,
    write: bool,
) -> Result<(), KernelError> {
    if write {
        UserU8SliceWO::new(addr, len).check(aspace)
    } else {
        UserU8SliceRO::new(addr, len).check(aspace)
    }
}

/// Reads the NUL-terminated string at `addr`.
///
/// The first byte is checked up front; the rest of the string is only
/// re-checked when it crosses into a new page.
pub fn check_string(aspace: &AddressSpace, addr: usize) -> Result<String, KernelError> {
    let start = check_pointer(aspace, addr)?;
    UserCString::new(start.into_usize()).read(aspace)
}
