//! A flat in-memory filesystem for MINOS.
//!
//! Every file lives in a heap buffer and is addressed by its name. Files are
//! reference counted: removing a file only unlinks its name, and the data
//! stays readable and writable through the handles that are still open.
//!
//! The filesystem also keeps the bookkeeping the kernel tests rely on: the
//! number of open handles, and an optional cap on it that makes `open` and
//! `reopen` fail on demand.
#![no_std]

extern crate alloc;

use alloc::{collections::btree_map::BTreeMap, string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use minos::{
    KernelError,
    fs::{InodeNumber, RegularFile, traits},
    sync::SpinLock,
};

/// Maximum length of a file name in bytes.
pub const NAME_MAX: usize = 14;

struct Inode {
    ino: InodeNumber,
    data: SpinLock<Vec<u8>>,
    deny_write: AtomicUsize,
}

struct Inner {
    files: SpinLock<BTreeMap<String, Arc<Inode>>>,
    next_ino: AtomicU32,
    open: AtomicUsize,
    open_limit: AtomicUsize,
}

impl Inner {
    fn open(self: &Arc<Self>, inode: Arc<Inode>) -> Result<RegularFile, KernelError> {
        let limit = self.open_limit.load(Ordering::SeqCst);
        self.open
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| KernelError::TooManyOpenFile)?;
        Ok(RegularFile::new(Handle {
            inode,
            fs: self.clone(),
        }))
    }
}

/// The in-memory filesystem.
///
/// Cloning the filesystem yields another handle to the same files.
#[derive(Clone)]
pub struct RamFs {
    inner: Arc<Inner>,
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl RamFs {
    /// Creates an empty filesystem.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                files: SpinLock::new(BTreeMap::new()),
                next_ino: AtomicU32::new(1),
                open: AtomicUsize::new(0),
                open_limit: AtomicUsize::new(usize::MAX),
            }),
        }
    }

    /// Creates or replaces the file `name` with `data`.
    pub fn add_file(&self, name: &str, data: &[u8]) -> Result<(), KernelError> {
        let inode = self.new_inode(Vec::from(data))?;
        let mut files = self.inner.files.lock();
        files.insert(String::from(name), inode);
        files.unlock();
        Ok(())
    }

    /// Current content of the file `name`.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        let inode = self.lookup(name)?;
        let data = inode.data.lock();
        let contents = data.clone();
        data.unlock();
        Some(contents)
    }

    /// Names of every file, in order.
    pub fn names(&self) -> Vec<String> {
        let files = self.inner.files.lock();
        let names = files.keys().cloned().collect();
        files.unlock();
        names
    }

    /// Number of open handles, including those of removed files.
    pub fn open_handles(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Caps the number of simultaneously open handles.
    ///
    /// Opening a file beyond the cap fails with
    /// [`KernelError::TooManyOpenFile`]. `None` lifts the cap.
    pub fn set_open_limit(&self, limit: Option<usize>) {
        self.inner
            .open_limit
            .store(limit.unwrap_or(usize::MAX), Ordering::SeqCst);
    }

    fn lookup(&self, name: &str) -> Option<Arc<Inode>> {
        let files = self.inner.files.lock();
        let inode = files.get(name).cloned();
        files.unlock();
        inode
    }

    fn new_inode(&self, data: Vec<u8>) -> Result<Arc<Inode>, KernelError> {
        let ino = InodeNumber::new(self.inner.next_ino.fetch_add(1, Ordering::SeqCst))
            .ok_or(KernelError::NoMemory)?;
        Ok(Arc::new(Inode {
            ino,
            data: SpinLock::new(data),
            deny_write: AtomicUsize::new(0),
        }))
    }
}

impl traits::FileSystem for RamFs {
    fn open(&self, name: &str) -> Result<RegularFile, KernelError> {
        let inode = self.lookup(name).ok_or(KernelError::NoSuchEntry)?;
        self.inner.open(inode)
    }

    fn create(&self, name: &str, initial_size: usize) -> Result<(), KernelError> {
        if name.len() > NAME_MAX {
            return Err(KernelError::InvalidArgument);
        }
        let inode = self.new_inode(alloc::vec![0; initial_size])?;
        let mut files = self.inner.files.lock();
        let created = !files.contains_key(name);
        if created {
            files.insert(String::from(name), inode);
        }
        files.unlock();
        if created {
            Ok(())
        } else {
            Err(KernelError::FileExist)
        }
    }

    fn remove(&self, name: &str) -> Result<(), KernelError> {
        let mut files = self.inner.files.lock();
        let removed = files.remove(name);
        files.unlock();
        removed.map(drop).ok_or(KernelError::NoSuchEntry)
    }
}

/// An open handle to a file.
struct Handle {
    inode: Arc<Inode>,
    fs: Arc<Inner>,
}

impl traits::RegularFile for Handle {
    fn ino(&self) -> InodeNumber {
        self.inode.ino
    }

    fn size(&self) -> usize {
        let data = self.inode.data.lock();
        let size = data.len();
        data.unlock();
        size
    }

    fn read_at(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let data = self.inode.data.lock();
        let n = data.len().saturating_sub(position).min(buf.len());
        if n > 0 {
            buf[..n].copy_from_slice(&data[position..position + n]);
        }
        data.unlock();
        Ok(n)
    }

    fn write_at(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        if self.inode.deny_write.load(Ordering::SeqCst) > 0 {
            return Ok(0);
        }
        let end = position
            .checked_add(buf.len())
            .ok_or(KernelError::InvalidArgument)?;
        let mut data = self.inode.data.lock();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[position..end].copy_from_slice(buf);
        data.unlock();
        Ok(buf.len())
    }

    fn reopen(&self) -> Result<RegularFile, KernelError> {
        self.fs.open(self.inode.clone())
    }

    fn deny_write(&self) {
        self.inode.deny_write.fetch_add(1, Ordering::SeqCst);
    }

    fn allow_write(&self) {
        self.inode.deny_write.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.fs.open.fetch_sub(1, Ordering::SeqCst);
    }
}
