//! Virtual addressing scheme of the machine.
//!
//! User programs live in the lower half of the address space. Every address
//! at or above [`KERNEL_BASE`] belongs to the kernel and is never mapped into
//! a user address space.
//!
//! [`Va`] supports the arithmetic needed for page walking:
//!
//! ```
//! let va = Va::new(0x4747_fff8).unwrap();
//! assert_eq!(va.page_down(), Va::new(0x4747_f000).unwrap());
//! assert_eq!(va.offset(), 0xff8);
//! let next = va + 8; // Crosses into the next page.
//! ```

/// The size of a single page in memory, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
pub const PAGE_SHIFT: usize = 12;

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// The first kernel virtual address.
///
/// Every address at or above this value is reserved for the kernel.
pub const KERNEL_BASE: usize = 0x80_0400_0000;

/// Virtual address.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is canonical.
    ///
    /// Only the low 48 bits are addressable; any higher address is rejected.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0x1_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the virtual address into the raw usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Returns true if the address falls in the kernel's reserved range.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_BASE
    }

    /// Align down the address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up the address to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Offset of the address within its page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Adds `rhs` bytes, failing on overflow or a non-canonical result.
    #[inline]
    pub fn checked_add(self, rhs: usize) -> Option<Self> {
        self.0.checked_add(rhs).and_then(Self::new)
    }
}

impl core::ops::Add<usize> for Va {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl core::ops::AddAssign<usize> for Va {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

impl core::ops::Sub<usize> for Va {
    type Output = Self;

    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl core::ops::Sub<Va> for Va {
    type Output = usize;

    fn sub(self, rhs: Va) -> Self::Output {
        self.0 - rhs.0
    }
}

impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va({:#x})", self.0)
    }
}
