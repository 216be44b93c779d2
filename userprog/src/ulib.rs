//! User library.
//!
//! Typed wrappers around the raw system calls, for user programs written
//! against a [`UserContext`]. Every wrapper marshals its arguments into user
//! memory exactly like a C library would: strings are copied into the data
//! region of the program and passed by address.
//!
//! ```rust
//! loader::register("echo", |ctx| {
//!     for arg in ctx.args().iter().skip(1) {
//!         ctx.print(arg);
//!         ctx.print(" ");
//!     }
//!     ctx.print("\n");
//!     0
//! });
//! ```
use crate::SyscallNumber;
use alloc::vec::Vec;
use minos::user::UserContext;

fn call(ctx: &mut UserContext, no: SyscallNumber, args: [usize; 6]) -> isize {
    ctx.syscall(no as usize, args)
}

/// The system calls, as seen by a user program.
pub trait UserLib {
    /// Powers the machine off.
    fn halt(&mut self) -> !;
    /// Terminates the process with `status`.
    fn exit(&mut self, status: i32) -> !;
    /// Forks the process. The child runs `child`; the parent gets the pid of
    /// the child or -1.
    fn fork(
        &mut self,
        name: &str,
        child: impl FnOnce(&mut UserContext) -> i32 + Send + 'static,
    ) -> isize;
    /// Replaces the program image. Returns -1 if the command cannot run.
    fn exec(&mut self, cmdline: &str) -> isize;
    /// Waits for the child `pid`.
    fn wait(&mut self, pid: isize) -> isize;
    /// Creates the file `path` of `initial_size` bytes.
    fn create(&mut self, path: &str, initial_size: usize) -> bool;
    /// Removes the file `path`.
    fn remove(&mut self, path: &str) -> bool;
    /// Opens the file `path`.
    fn open(&mut self, path: &str) -> isize;
    /// Size of the file open at `fd`.
    fn filesize(&mut self, fd: isize) -> isize;
    /// Reads up to `len` bytes from `fd` into the user buffer at `buf`.
    fn read(&mut self, fd: isize, buf: usize, len: usize) -> isize;
    /// Writes `len` bytes of the user buffer at `buf` to `fd`.
    fn write(&mut self, fd: isize, buf: usize, len: usize) -> isize;
    /// Moves the cursor of `fd` to `pos`.
    fn seek(&mut self, fd: isize, pos: usize);
    /// Position of the cursor of `fd`.
    fn tell(&mut self, fd: isize) -> isize;
    /// Closes `fd`.
    fn close(&mut self, fd: isize);

    /// Writes `data` to `fd` from a fresh user buffer.
    fn write_bytes(&mut self, fd: isize, data: &[u8]) -> isize;
    /// Reads up to `len` bytes from `fd`. Returns `None` on error.
    fn read_bytes(&mut self, fd: isize, len: usize) -> Option<Vec<u8>>;
    /// Prints `s` on the console.
    fn print(&mut self, s: &str) {
        self.write_bytes(1, s.as_bytes());
    }
}

impl UserLib for UserContext {
    fn halt(&mut self) -> ! {
        call(self, SyscallNumber::Halt, [0; 6]);
        unreachable!("halt returned")
    }

    fn exit(&mut self, status: i32) -> ! {
        call(self, SyscallNumber::Exit, [status as usize, 0, 0, 0, 0, 0]);
        unreachable!("exit returned")
    }

    fn fork(
        &mut self,
        name: &str,
        child: impl FnOnce(&mut UserContext) -> i32 + Send + 'static,
    ) -> isize {
        let name = self.push_cstr(name);
        self.syscall_forking(SyscallNumber::Fork as usize, [name, 0, 0, 0, 0, 0], child)
    }

    fn exec(&mut self, cmdline: &str) -> isize {
        let cmdline = self.push_cstr(cmdline);
        call(self, SyscallNumber::Exec, [cmdline, 0, 0, 0, 0, 0])
    }

    fn wait(&mut self, pid: isize) -> isize {
        call(self, SyscallNumber::Wait, [pid as usize, 0, 0, 0, 0, 0])
    }

    fn create(&mut self, path: &str, initial_size: usize) -> bool {
        let path = self.push_cstr(path);
        call(self, SyscallNumber::Create, [path, initial_size, 0, 0, 0, 0]) == 1
    }

    fn remove(&mut self, path: &str) -> bool {
        let path = self.push_cstr(path);
        call(self, SyscallNumber::Remove, [path, 0, 0, 0, 0, 0]) == 1
    }

    fn open(&mut self, path: &str) -> isize {
        let path = self.push_cstr(path);
        call(self, SyscallNumber::Open, [path, 0, 0, 0, 0, 0])
    }

    fn filesize(&mut self, fd: isize) -> isize {
        call(self, SyscallNumber::Filesize, [fd as usize, 0, 0, 0, 0, 0])
    }

    fn read(&mut self, fd: isize, buf: usize, len: usize) -> isize {
        call(self, SyscallNumber::Read, [fd as usize, buf, len, 0, 0, 0])
    }

    fn write(&mut self, fd: isize, buf: usize, len: usize) -> isize {
        call(self, SyscallNumber::Write, [fd as usize, buf, len, 0, 0, 0])
    }

    fn seek(&mut self, fd: isize, pos: usize) {
        call(self, SyscallNumber::Seek, [fd as usize, pos, 0, 0, 0, 0]);
    }

    fn tell(&mut self, fd: isize) -> isize {
        call(self, SyscallNumber::Tell, [fd as usize, 0, 0, 0, 0, 0])
    }

    fn close(&mut self, fd: isize) {
        call(self, SyscallNumber::Close, [fd as usize, 0, 0, 0, 0, 0]);
    }

    fn write_bytes(&mut self, fd: isize, data: &[u8]) -> isize {
        let buf = self.push_bytes(data);
        self.write(fd, buf, data.len())
    }

    fn read_bytes(&mut self, fd: isize, len: usize) -> Option<Vec<u8>> {
        let buf = self.alloc(len);
        let n = self.read(fd, buf, len);
        if n < 0 {
            return None;
        }
        let mut data = alloc::vec![0; n as usize];
        self.load(buf, &mut data);
        Some(data)
    }
}
