//! Filesystem abstraction.
//!
//! MINOS does not implement a filesystem by itself. A filesystem crate
//! implements [`traits::FileSystem`] and [`traits::RegularFile`] and is
//! installed with [`FileSystem::register`]. The kernel then works with two
//! handle types:
//!
//! - [`RegularFile`]: a reference to an open inode.
//! - [`File`]: an open file as seen by a process, with its own cursor and
//!   write-denial state.
//!
//! The filesystem is flat: a path is a single file name.
use crate::{KernelError, sync::SpinLock};
use alloc::sync::Arc;
use core::num::NonZeroU32;

/// Defines traits for file system operations.
pub mod traits {
    use super::InodeNumber;
    use crate::KernelError;

    /// Trait representing a filesystem.
    pub trait FileSystem
    where
        Self: Sync + Send,
    {
        /// Opens the file `name`.
        fn open(&self, name: &str) -> Result<super::RegularFile, KernelError>;

        /// Creates the file `name` of `initial_size` zero bytes.
        ///
        /// Fails with [`KernelError::FileExist`] if the file exists.
        fn create(&self, name: &str, initial_size: usize) -> Result<(), KernelError>;

        /// Removes the file `name`.
        ///
        /// Open handles of a removed file stay usable until they are closed.
        fn remove(&self, name: &str) -> Result<(), KernelError>;
    }

    /// Trait representing an open regular file.
    ///
    /// Dropping the object closes it.
    pub trait RegularFile
    where
        Self: Send + Sync,
    {
        /// Returns the inode number of the file.
        fn ino(&self) -> InodeNumber;

        /// Returns the size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads up to `buf.len()` bytes at `position`.
        ///
        /// Returns the number of bytes read, which is short at the end of
        /// the file.
        fn read_at(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError>;

        /// Writes `buf` at `position`, extending the file if needed.
        ///
        /// Returns the number of bytes written, which is 0 while writes to
        /// the file are denied.
        fn write_at(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError>;

        /// Opens the same file again as an independent handle.
        fn reopen(&self) -> Result<super::RegularFile, KernelError>;

        /// Denies writes to the file until a matching
        /// [`RegularFile::allow_write`].
        fn deny_write(&self);

        /// Re-allows writes denied by [`RegularFile::deny_write`].
        fn allow_write(&self);
    }
}

/// Represents a unique identifier for an inode in the filesystem.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct InodeNumber(NonZeroU32);

impl InodeNumber {
    /// Creates a [`InodeNumber`] if the given value is not zero.
    pub const fn new(n: u32) -> Option<Self> {
        if let Some(v) = NonZeroU32::new(n) {
            Some(Self(v))
        } else {
            None
        }
    }
}

/// The global filesystem.
pub struct FileSystem {
    _p: (),
}

static FS: SpinLock<Option<Arc<dyn traits::FileSystem>>> = SpinLock::new(None);

pub(crate) fn init() {
    let mut fs = FS.lock();
    *fs = None;
    fs.unlock();
}

impl FileSystem {
    /// Register the global file system.
    pub fn register(fs: impl traits::FileSystem + 'static) {
        let mut guard = FS.lock();
        *guard = Some(Arc::new(fs));
        guard.unlock();
    }

    fn get() -> Result<Arc<dyn traits::FileSystem>, KernelError> {
        let guard = FS.lock();
        let fs = (*guard).clone();
        guard.unlock();
        fs.ok_or(KernelError::NoSuchEntry)
    }

    /// Opens the file at `path`.
    pub fn open(path: &str) -> Result<File, KernelError> {
        if path.is_empty() {
            return Err(KernelError::NoSuchEntry);
        }
        Self::get()?.open(path).map(File::new)
    }

    /// Creates a file at `path` of `initial_size` bytes.
    pub fn create(path: &str, initial_size: usize) -> Result<(), KernelError> {
        if path.is_empty() {
            return Err(KernelError::NoSuchEntry);
        }
        Self::get()?.create(path, initial_size)
    }

    /// Removes the file at `path`.
    pub fn remove(path: &str) -> Result<(), KernelError> {
        Self::get()?.remove(path)
    }
}

/// A handle to an open inode.
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Creates a new [`RegularFile`] handle from a given implementation of
    /// [`traits::RegularFile`].
    pub fn new(r: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(r))
    }

    /// Inode number of the file.
    pub fn ino(&self) -> InodeNumber {
        self.0.ino()
    }

    /// Returns the size of the file in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }
}

/// An open file with its own cursor.
///
/// Closing the file (dropping it) re-allows writes that this handle denied.
pub struct File {
    file: RegularFile,
    pos: usize,
    deny_write: bool,
}

impl File {
    /// Wraps an open inode with a cursor at offset 0.
    pub fn new(file: RegularFile) -> Self {
        Self {
            file,
            pos: 0,
            deny_write: false,
        }
    }

    /// Inode number of the file.
    pub fn ino(&self) -> InodeNumber {
        self.file.ino()
    }

    /// Reads at the cursor and advances it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let n = self.file.0.read_at(self.pos, buf)?;
        self.pos += n;
        Ok(n)
    }

    /// Writes at the cursor and advances it.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, KernelError> {
        let n = self.file.0.write_at(self.pos, buf)?;
        self.pos += n;
        Ok(n)
    }

    /// Moves the cursor to `pos`.
    ///
    /// The cursor may move past the end of the file; reads there return 0
    /// bytes and writes extend the file.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Position of the cursor.
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Size of the file in bytes.
    pub fn len(&self) -> usize {
        self.file.size()
    }

    /// Returns true if the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Denies writes to the file while this handle is open.
    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.deny_write = true;
            self.file.0.deny_write();
        }
    }

    /// Opens an independent handle to the same file.
    ///
    /// The new handle starts at the same cursor and also denies writes if
    /// this one does.
    pub fn duplicate(&self) -> Result<Self, KernelError> {
        let mut file = Self::new(self.file.0.reopen()?);
        file.pos = self.pos;
        if self.deny_write {
            file.deny_write();
        }
        Ok(file)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.deny_write {
            self.file.0.allow_write();
        }
    }
}
