//! # File descriptor table and file system calls.
//!
//! Each process owns a [`FileStruct`]: a fixed table of
//! [`FDT_CAPACITY`] slots mapping small integers, the file descriptors, to
//! open [`File`]s. The first two descriptors are wired to the console and
//! never hold a file:
//!
//! | Descriptor | Stream                        |
//! |------------|-------------------------------|
//! | 0          | standard input (the keyboard) |
//! | 1          | standard output (the console) |
//!
//! Descriptors are handed out by a cursor that scans forward from the last
//! allocation and wraps around. Closing a descriptor below the cursor moves
//! the cursor back, so the smallest free descriptor is reused first.
//!
//! Every open file carries its own cursor. A forked child gets an independent
//! copy of each open file ([`FileStruct::duplicate`]): reading or closing in
//! the child leaves the parent's files untouched.
use crate::{FS_LOCK, guard, syscall::SyscallAbi};
use alloc::{string::String, vec::Vec};
use minos::{
    KernelError,
    fs::{File, FileSystem},
    mm::AddressSpace,
    print,
    syscall::uaccess::{UserU8SliceRO, UserU8SliceWO},
};

/// Number of slots in a file descriptor table.
pub const FDT_CAPACITY: usize = 128;

/// The file descriptor.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct FileDescriptor(pub i32);

impl FileDescriptor {
    /// Standard input.
    pub const STDIN: Self = Self(0);
    /// Standard output.
    pub const STDOUT: Self = Self(1);
    /// First descriptor that can hold a file.
    pub const FIRST: Self = Self(2);

    fn from_arg(arg: usize) -> Result<Self, KernelError> {
        i32::try_from(arg)
            .map(Self)
            .map_err(|_| KernelError::BadFileDescriptor)
    }

    fn slot(self) -> Option<usize> {
        usize::try_from(self.0)
            .ok()
            .filter(|idx| (Self::FIRST.0 as usize..FDT_CAPACITY).contains(idx))
    }
}

/// The file descriptor table of a process.
pub struct FileStruct {
    slots: Vec<Option<File>>,
    next_fd: usize,
}

impl Default for FileStruct {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStruct {
    /// Creates a table with nothing but the console streams.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(FDT_CAPACITY);
        slots.resize_with(FDT_CAPACITY, || None);
        Self {
            slots,
            next_fd: FileDescriptor::FIRST.0 as usize,
        }
    }

    /// Installs `file` in the first free slot at or after the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::TooManyOpenFile`] if every slot is taken. The
    /// file is closed in that case.
    pub fn add(&mut self, file: File) -> Result<FileDescriptor, KernelError> {
        let first = FileDescriptor::FIRST.0 as usize;
        let usable = FDT_CAPACITY - first;
        let free = (0..usable)
            .map(|i| first + (self.next_fd - first + i) % usable)
            .find(|idx| self.slots[*idx].is_none())
            .ok_or(KernelError::TooManyOpenFile)?;
        self.slots[free] = Some(file);
        self.next_fd = if free + 1 == FDT_CAPACITY {
            first
        } else {
            free + 1
        };
        Ok(FileDescriptor(free as i32))
    }

    /// The file open at `fd`.
    ///
    /// Out-of-range, reserved and empty descriptors all read as `None`.
    pub fn get(&mut self, fd: FileDescriptor) -> Option<&mut File> {
        self.slots.get_mut(fd.slot()?)?.as_mut()
    }

    /// Detaches the file at `fd` from the table without closing it.
    pub fn remove(&mut self, fd: FileDescriptor) -> Option<File> {
        let idx = fd.slot()?;
        let file = self.slots[idx].take()?;
        if idx < self.next_fd {
            self.next_fd = idx;
        }
        Some(file)
    }

    /// Number of open files.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns true if no file is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the table for a forked child.
    ///
    /// Every open file is reopened as an independent handle at the same
    /// descriptor, cursor and write-denial state. Either every file is
    /// copied or none is.
    pub fn duplicate(&self) -> Result<Self, KernelError> {
        let mut slots = Vec::with_capacity(FDT_CAPACITY);
        for slot in self.slots.iter() {
            slots.push(match slot {
                Some(file) => Some(file.duplicate()?),
                None => None,
            });
        }
        Ok(Self {
            slots,
            next_fd: self.next_fd,
        })
    }

    /// Closes every open file.
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            drop(slot.take());
        }
        self.next_fd = FileDescriptor::FIRST.0 as usize;
    }

    /// Creates a file.
    ///
    /// Returns 1 on success and 0 if the file cannot be created.
    pub fn create(&mut self, aspace: &AddressSpace, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = guard::check_string(aspace, abi.arg1)?;
        FS_LOCK.acquire();
        let r = FileSystem::create(&path, abi.arg2);
        FS_LOCK.release();
        Ok(r.is_ok() as usize)
    }

    /// Removes a file.
    ///
    /// Returns 1 on success and 0 otherwise. Open files of the removed path
    /// stay usable.
    pub fn unlink(&mut self, aspace: &AddressSpace, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = guard::check_string(aspace, abi.arg1)?;
        FS_LOCK.acquire();
        let r = FileSystem::remove(&path);
        FS_LOCK.release();
        Ok(r.is_ok() as usize)
    }

    /// Opens a file and returns its descriptor.
    pub fn open(&mut self, aspace: &AddressSpace, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = guard::check_string(aspace, abi.arg1)?;
        FS_LOCK.acquire();
        let r = FileSystem::open(&path).and_then(|file| self.add(file));
        FS_LOCK.release();
        r.map(|fd| fd.0 as usize)
    }

    /// Size of an open file in bytes.
    pub fn filesize(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let file = self
            .get(FileDescriptor::from_arg(abi.arg1)?)
            .ok_or(KernelError::BadFileDescriptor)?;
        FS_LOCK.acquire();
        let size = file.len();
        FS_LOCK.release();
        Ok(size)
    }

    /// Reads up to `arg3` bytes into the user buffer at `arg2`.
    ///
    /// Descriptor 0 reads the keyboard and returns early once no input is
    /// pending.
    pub fn read(&mut self, aspace: &mut AddressSpace, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let (buf, len) = (abi.arg2, abi.arg3);
        guard::check_buffer(aspace, buf, len, true)?;
        let fd = FileDescriptor::from_arg(abi.arg1)?;
        let mut data = alloc::vec![0u8; len];
        let n = if fd == FileDescriptor::STDIN {
            let mut n = 0;
            while n < len {
                match minos::getc() {
                    Some(b) => data[n] = b,
                    None => break,
                }
                n += 1;
            }
            n
        } else {
            let file = self.get(fd).ok_or(KernelError::BadFileDescriptor)?;
            FS_LOCK.acquire();
            let r = file.read(&mut data);
            FS_LOCK.release();
            r?
        };
        UserU8SliceWO::new(buf, n).put(aspace, &data[..n])
    }

    /// Writes `arg3` bytes from the user buffer at `arg2`.
    ///
    /// Descriptor 1 writes the console. Writing a file whose executable is
    /// running stores nothing and returns 0.
    pub fn write(&mut self, aspace: &AddressSpace, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let (buf, len) = (abi.arg2, abi.arg3);
        guard::check_buffer(aspace, buf, len, false)?;
        let fd = FileDescriptor::from_arg(abi.arg1)?;
        let data = UserU8SliceRO::new(buf, len).get(aspace)?;
        if fd == FileDescriptor::STDOUT {
            print!("{}", String::from_utf8_lossy(&data));
            return Ok(len);
        }
        let file = self.get(fd).ok_or(KernelError::BadFileDescriptor)?;
        FS_LOCK.acquire();
        let r = file.write(&data);
        FS_LOCK.release();
        r
    }

    /// Moves the cursor of an open file to `arg2`.
    pub fn seek(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let file = self
            .get(FileDescriptor::from_arg(abi.arg1)?)
            .ok_or(KernelError::BadFileDescriptor)?;
        file.seek(abi.arg2);
        Ok(0)
    }

    /// Position of the cursor of an open file.
    pub fn tell(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        self.get(FileDescriptor::from_arg(abi.arg1)?)
            .map(|file| file.tell())
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Closes a descriptor.
    pub fn close(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let file = self
            .remove(FileDescriptor::from_arg(abi.arg1)?)
            .ok_or(KernelError::BadFileDescriptor)?;
        FS_LOCK.acquire();
        drop(file);
        FS_LOCK.release();
        Ok(0)
    }
}
