//! User address space.
//!
//! An [`AddressSpace`] maps page-aligned user virtual addresses to [`Page`]s
//! with a [`Permission`]. Only the user half of the address space
//! (`< KERNEL_BASE`) can be mapped; the null page never is.
//!
//! Kernel code reads and writes user memory through [`AddressSpace::read`]
//! and [`AddressSpace::write`], which fail with [`KernelError::BadAddress`]
//! on any byte that is not accessible.
use super::Page;
use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
};
use alloc::collections::btree_map::BTreeMap;
use core::ops::Range;

bitflags::bitflags! {
    /// Access permission of a mapped page.
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;
        /// Page is writable.
        const WRITE = 1 << 1;
        /// Page can be referred by user application.
        const USER = 1 << 3;
    }
}

struct Mapping {
    page: Page,
    perm: Permission,
}

/// A user address space.
#[derive(Default)]
pub struct AddressSpace {
    mappings: BTreeMap<Va, Mapping>,
}

impl AddressSpace {
    /// Create an empty address space.
    pub fn new() -> Self {
        Self {
            mappings: BTreeMap::new(),
        }
    }

    /// Map `page` at `va` with `perm`.
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidArgument`] if `va` is not page-aligned, is the
    ///   null page or a kernel address.
    /// - [`KernelError::FileExist`] if `va` is already mapped.
    pub fn map(&mut self, va: Va, page: Page, perm: Permission) -> Result<(), KernelError> {
        if va.offset() != 0 || va.into_usize() == 0 || va.is_kernel() {
            return Err(KernelError::InvalidArgument);
        }
        if self.mappings.contains_key(&va) {
            return Err(KernelError::FileExist);
        }
        self.mappings.insert(va, Mapping { page, perm });
        Ok(())
    }

    /// Permission of the page containing `va`, if mapped.
    pub fn permission(&self, va: Va) -> Option<Permission> {
        self.mappings.get(&va.page_down()).map(|m| m.perm)
    }

    /// Returns true if the page containing `va` is mapped.
    pub fn is_mapped(&self, va: Va) -> bool {
        self.mappings.contains_key(&va.page_down())
    }

    /// Number of mapped pages.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Returns true if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Checks whether the user can access every byte of `addr`.
    ///
    /// The first page is always checked, so an empty range still requires
    /// its start address to be valid.
    pub fn access_ok(&self, addr: Range<Va>, is_write: bool) -> bool {
        if addr.start.into_usize() == 0 || addr.start.is_kernel() || addr.end < addr.start {
            return false;
        }
        let mut required = Permission::USER | Permission::READ;
        if is_write {
            required |= Permission::WRITE;
        }
        let mut page = addr.start.page_down();
        loop {
            if page.is_kernel() || !self.permission(page).is_some_and(|p| p.contains(required)) {
                return false;
            }
            page += PAGE_SIZE;
            if page >= addr.end {
                return true;
            }
        }
    }

    /// Copies user memory at `va` into `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::BadAddress`] if any byte is not readable.
    pub fn read(&self, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let at = va.checked_add(done).ok_or(KernelError::BadAddress)?;
            let mapping = self
                .mappings
                .get(&at.page_down())
                .filter(|m| m.perm.contains(Permission::READ))
                .ok_or(KernelError::BadAddress)?;
            let n = (PAGE_SIZE - at.offset()).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&mapping.page.inner()[at.offset()..at.offset() + n]);
            done += n;
        }
        Ok(())
    }

    /// Copies `data` into user memory at `va`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::BadAddress`] if any byte is not writable.
    pub fn write(&mut self, va: Va, data: &[u8]) -> Result<(), KernelError> {
        let end = va.checked_add(data.len()).ok_or(KernelError::BadAddress)?;
        if !data.is_empty() && !self.writable(va..end) {
            return Err(KernelError::BadAddress);
        }
        let mut done = 0;
        while done < data.len() {
            let at = va + done;
            let Some(mapping) = self.mappings.get_mut(&at.page_down()) else {
                return Err(KernelError::BadAddress);
            };
            let n = (PAGE_SIZE - at.offset()).min(data.len() - done);
            mapping.page.inner_mut()[at.offset()..at.offset() + n]
                .copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn writable(&self, addr: Range<Va>) -> bool {
        let mut page = addr.start.page_down();
        while page < addr.end {
            if !self
                .permission(page)
                .is_some_and(|p| p.contains(Permission::WRITE))
            {
                return false;
            }
            page += PAGE_SIZE;
        }
        true
    }

    /// Creates a copy of the address space with freshly allocated pages.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::NoMemory`] if the page pool runs out; pages
    /// copied so far are released.
    pub fn duplicate(&self) -> Result<Self, KernelError> {
        let mut mappings = BTreeMap::new();
        for (va, mapping) in self.mappings.iter() {
            mappings.insert(
                *va,
                Mapping {
                    page: mapping.page.duplicate()?,
                    perm: mapping.perm,
                },
            );
        }
        Ok(Self { mappings })
    }
}
