//! User memory access.
//!
//! Every pointer a user program passes to the kernel is untrusted: it may be
//! null, point into the kernel half of the address space, or point to memory
//! that is not mapped at all. The wrappers in this module check an access
//! against the [`AddressSpace`] of the calling process before any byte is
//! copied, and report [`KernelError::BadAddress`] on any violation.
//!
//! | Wrapper           | Direction       | Checked range                      |
//! |-------------------|-----------------|------------------------------------|
//! | [`UserPtrRO`]     | user -> kernel  | `size_of::<T>()` bytes             |
//! | [`UserU8SliceRO`] | user -> kernel  | `len` bytes                        |
//! | [`UserU8SliceWO`] | kernel -> user  | `len` bytes, writable              |
//! | [`UserCString`]   | user -> kernel  | up to the NUL byte                 |
//!
//! The start address is checked even for zero-length accesses.
use crate::{KernelError, mm::AddressSpace};
use alloc::{string::String, vec::Vec};
use bedrock::addressing::{PAGE_SIZE, Va};
use core::{marker::PhantomData, ops::Range};

fn access_range(addr: usize, len: usize) -> Result<Range<Va>, KernelError> {
    let start = Va::new(addr).ok_or(KernelError::BadAddress)?;
    let end = start.checked_add(len).ok_or(KernelError::BadAddress)?;
    Ok(start..end)
}

/// A read-only user pointer to a `T`.
///
/// `T` must be valid for any bit pattern.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserPtrRO<T>
where
    T: Copy,
{
    addr: usize,
    _ty: PhantomData<T>,
}

impl<T> UserPtrRO<T>
where
    T: Copy,
{
    /// Wraps the user address `addr`.
    pub fn new(addr: usize) -> Self {
        UserPtrRO {
            addr,
            _ty: PhantomData,
        }
    }

    /// Reads the value from `aspace`.
    pub fn get(self, aspace: &AddressSpace) -> Result<T, KernelError> {
        let size = core::mem::size_of::<T>();
        let range = access_range(self.addr, size)?;
        if !aspace.access_ok(range.clone(), false) {
            return Err(KernelError::BadAddress);
        }
        let mut buf = alloc::vec![0u8; size];
        aspace.read(range.start, &mut buf)?;
        // SAFETY: `buf` holds `size_of::<T>()` initialized bytes and `T` is
        // valid for any bit pattern.
        Ok(unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const T) })
    }
}

/// A read-only user byte buffer.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserU8SliceRO {
    addr: usize,
    len: usize,
}

impl UserU8SliceRO {
    /// Wraps `len` bytes at the user address `addr`.
    pub fn new(addr: usize, len: usize) -> Self {
        UserU8SliceRO { addr, len }
    }

    /// Checks the buffer without copying it.
    pub fn check(&self, aspace: &AddressSpace) -> Result<(), KernelError> {
        if aspace.access_ok(access_range(self.addr, self.len)?, false) {
            Ok(())
        } else {
            Err(KernelError::BadAddress)
        }
    }

    /// Copies the buffer out of `aspace`.
    pub fn get(self, aspace: &AddressSpace) -> Result<Vec<u8>, KernelError> {
        self.check(aspace)?;
        let mut result = alloc::vec![0u8; self.len];
        if let Some(start) = Va::new(self.addr) {
            aspace.read(start, &mut result)?;
        }
        Ok(result)
    }
}

/// A write-only user byte buffer.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserU8SliceWO {
    addr: usize,
    len: usize,
}

impl UserU8SliceWO {
    /// Wraps `len` bytes at the user address `addr`.
    pub fn new(addr: usize, len: usize) -> Self {
        UserU8SliceWO { addr, len }
    }

    /// Checks that the whole buffer is writable without touching it.
    pub fn check(&self, aspace: &AddressSpace) -> Result<(), KernelError> {
        if aspace.access_ok(access_range(self.addr, self.len)?, true) {
            Ok(())
        } else {
            Err(KernelError::BadAddress)
        }
    }

    /// Copies `other` into the buffer, truncated to the buffer length.
    ///
    /// Returns the number of bytes written.
    pub fn put(self, aspace: &mut AddressSpace, other: &[u8]) -> Result<usize, KernelError> {
        self.check(aspace)?;
        let size = self.len.min(other.len());
        if let Some(start) = Va::new(self.addr) {
            aspace.write(start, &other[..size])?;
        }
        Ok(size)
    }
}

/// A NUL-terminated string in user memory.
#[derive(PartialEq, PartialOrd, Eq, Ord, Debug)]
pub struct UserCString {
    addr: usize,
}

impl UserCString {
    /// Wraps the user address `addr`.
    pub fn new(addr: usize) -> Self {
        Self { addr }
    }

    /// Reads the string out of `aspace`.
    ///
    /// The first byte is validated up front; after that only the crossing
    /// into a new page is validated again.
    ///
    /// # Errors
    ///
    /// - [`KernelError::BadAddress`] if the string starts or runs into an
    ///   inaccessible page.
    /// - [`KernelError::InvalidArgument`] if the string is not UTF-8.
    pub fn read(self, aspace: &AddressSpace) -> Result<String, KernelError> {
        let mut at = Va::new(self.addr).ok_or(KernelError::BadAddress)?;
        let mut result = Vec::new();
        let mut page = [0u8; PAGE_SIZE];
        loop {
            if !aspace.access_ok(at..at, false) {
                return Err(KernelError::BadAddress);
            }
            let chunk = &mut page[..PAGE_SIZE - at.offset()];
            aspace.read(at, chunk)?;
            match chunk.iter().position(|b| *b == 0) {
                Some(nul) => {
                    result.extend_from_slice(&chunk[..nul]);
                    return String::from_utf8(result).map_err(|_| KernelError::InvalidArgument);
                }
                None => {
                    result.extend_from_slice(chunk);
                    at = at.checked_add(chunk.len()).ok_or(KernelError::BadAddress)?;
                }
            }
        }
    }
}
