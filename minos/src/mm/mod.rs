//! Memory Management.
//!
//! The core abstraction is the [`Page`], a single page of memory taken from
//! the machine's page pool. A page is allocated by creating an instance of
//! [`Page`]; once the instance is dropped, the page returns to the pool.
//!
//! The pool is bounded by the page limit given at boot
//! ([`SystemConfigurationBuilder::max_pages`]). When the pool is exhausted,
//! [`Page::new`] fails with [`KernelError::NoMemory`], which lets tests drive
//! the kernel into out-of-memory paths deterministically.
//!
//! User memory is described by an [`AddressSpace`].
//!
//! [`SystemConfigurationBuilder::max_pages`]: crate::SystemConfigurationBuilder::max_pages
pub mod address_space;

pub use address_space::{AddressSpace, Permission};

use crate::{KernelError, addressing::PAGE_SIZE};
use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};

static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static LIMIT: AtomicUsize = AtomicUsize::new(crate::DEFAULT_MAX_PAGES);

pub(crate) fn init(max_pages: usize) {
    ALLOCATED.store(0, Ordering::SeqCst);
    LIMIT.store(max_pages, Ordering::SeqCst);
}

/// Number of pages currently allocated.
pub fn allocated_pages() -> usize {
    ALLOCATED.load(Ordering::SeqCst)
}

/// A page of memory.
pub struct Page {
    frame: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// Allocate a new zeroed page.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::NoMemory`] if the page pool is exhausted.
    pub fn new() -> Result<Self, KernelError> {
        let limit = LIMIT.load(Ordering::SeqCst);
        ALLOCATED
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| KernelError::NoMemory)?;
        Ok(Self {
            frame: Box::new([0; PAGE_SIZE]),
        })
    }

    /// Get a reference to the page content.
    pub fn inner(&self) -> &[u8] {
        &self.frame[..]
    }

    /// Get a mutable reference to the page content.
    pub fn inner_mut(&mut self) -> &mut [u8] {
        &mut self.frame[..]
    }

    /// Allocate a new page holding a copy of this page.
    pub fn duplicate(&self) -> Result<Self, KernelError> {
        let mut page = Self::new()?;
        page.inner_mut().copy_from_slice(self.inner());
        Ok(page)
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        ALLOCATED.fetch_sub(1, Ordering::SeqCst);
    }
}
