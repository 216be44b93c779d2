//! Executable loader.
//!
//! MINOS executables are tiny: a header made of the [`MAGIC`] bytes and the
//! NUL-terminated name of a program registered with [`register`]. The code
//! of a program is a host closure that runs against a
//! [`UserContext`]; the header only tells the loader which closure the image
//! runs.
//!
//! [`load`] turns an executable file into a fresh user image:
//!
//! ```text
//!   USER_STACK +----------------+
//!              | argument bytes |
//!              | argv[] + NULL  |
//!              | return address | <- rsp
//!              +----------------+  (one stack page)
//!                     ...
//!   DATA_BASE  +----------------+
//!              | bump cursor    |  (DATA_PAGES writable pages)
//!              | heap ...       |
//!              +----------------+
//!                     ...
//!   CODE_BASE  +----------------+
//!              | header         |  (read-only text page) <- rip
//!              +----------------+
//! ```
//!
//! On entry `rdi` holds `argc` and `rsi` the address of `argv`.
use crate::{
    KernelError,
    fs::File,
    mm::{AddressSpace, Page, Permission},
    sync::SpinLock,
    user::UserContext,
};
use alloc::{collections::btree_map::BTreeMap, string::String, sync::Arc, vec::Vec};
use bedrock::{
    addressing::{PAGE_SIZE, Va},
    interrupt::Registers,
};

/// Magic bytes at the start of every executable.
pub const MAGIC: &[u8; 4] = b"\x7fMXE";
/// Address of the text page.
pub const CODE_BASE: usize = 0x40_0000;
/// Address of the data region.
pub const DATA_BASE: usize = 0x60_0000;
/// Number of pages in the data region.
pub const DATA_PAGES: usize = 4;
/// Top of the user stack.
pub const USER_STACK: usize = 0x4748_0000;
/// Maximum number of command line arguments.
pub const MAX_ARGS: usize = 64;

/// The code of a user program. Its return value is the exit status.
pub type Program = Arc<dyn Fn(&mut UserContext) -> i32 + Send + Sync>;

static PROGRAMS: SpinLock<BTreeMap<String, Program>> = SpinLock::new(BTreeMap::new());

pub(crate) fn init() {
    let mut programs = PROGRAMS.lock();
    let old = core::mem::take(&mut *programs);
    programs.unlock();
    drop(old);
}

/// Registers `program` under `name`.
pub fn register(name: &str, program: impl Fn(&mut UserContext) -> i32 + Send + Sync + 'static) {
    let mut programs = PROGRAMS.lock();
    programs.insert(String::from(name), Arc::new(program));
    programs.unlock();
}

/// Looks up the program registered under `name`.
pub fn lookup(name: &str) -> Option<Program> {
    let programs = PROGRAMS.lock();
    let program = programs.get(name).cloned();
    programs.unlock();
    program
}

/// Builds the executable file content that runs the program `name`.
pub fn image(name: &str) -> Vec<u8> {
    let mut image = Vec::from(&MAGIC[..]);
    image.extend_from_slice(name.as_bytes());
    image.push(0);
    image
}

/// Extracts the program name from an executable header.
pub fn parse_header(header: &[u8]) -> Option<&str> {
    let body = header.strip_prefix(&MAGIC[..])?;
    let nul = body.iter().position(|b| *b == 0)?;
    core::str::from_utf8(&body[..nul]).ok()
}

/// A loaded user image, ready to run.
pub struct Image {
    /// The address space of the image.
    pub address_space: AddressSpace,
    /// The initial register state.
    pub registers: Registers,
}

/// Loads the executable `file` with the command line `argv`.
///
/// `argv[0]` is the program name as typed by the user.
///
/// # Errors
///
/// - [`KernelError::NoExec`] if the file is not an executable or names an
///   unknown program.
/// - [`KernelError::InvalidArgument`] if `argv` is empty, has more than
///   [`MAX_ARGS`] entries or does not fit in the stack page.
/// - [`KernelError::NoMemory`] if the page pool runs out.
pub fn load(file: &mut File, argv: &[&str]) -> Result<Image, KernelError> {
    if argv.is_empty() || argv.len() > MAX_ARGS {
        return Err(KernelError::InvalidArgument);
    }
    let mut header = alloc::vec![0u8; PAGE_SIZE];
    file.seek(0);
    let len = file.read(&mut header)?;
    header.truncate(len);
    let name = parse_header(&header).ok_or(KernelError::NoExec)?;
    if lookup(name).is_none() {
        debug!("Executable names an unknown program {name}.");
        return Err(KernelError::NoExec);
    }

    let mut address_space = AddressSpace::new();
    let mut text = Page::new()?;
    text.inner_mut()[..header.len()].copy_from_slice(&header);
    address_space.map(va(CODE_BASE)?, text, Permission::USER | Permission::READ)?;

    let rw = Permission::USER | Permission::READ | Permission::WRITE;
    for i in 0..DATA_PAGES {
        address_space.map(va(DATA_BASE + i * PAGE_SIZE)?, Page::new()?, rw)?;
    }
    let heap = (DATA_BASE + 8) as u64;
    address_space.write(va(DATA_BASE)?, &heap.to_le_bytes())?;
    address_space.map(va(USER_STACK - PAGE_SIZE)?, Page::new()?, rw)?;

    let mut registers = Registers::new();
    let rsp = push_arguments(&mut address_space, argv)?;
    registers.gprs.rdi = argv.len();
    registers.gprs.rsi = rsp + 8;
    *registers.rip() = CODE_BASE;
    *registers.rsp() = rsp;

    Ok(Image {
        address_space,
        registers,
    })
}

fn va(addr: usize) -> Result<Va, KernelError> {
    Va::new(addr).ok_or(KernelError::InvalidArgument)
}

/// Pushes the argument strings, the argv array and a fake return address on
/// the stack. Returns the final stack pointer.
fn push_arguments(aspace: &mut AddressSpace, argv: &[&str]) -> Result<usize, KernelError> {
    let bottom = USER_STACK - PAGE_SIZE;
    let mut sp = USER_STACK;
    let push = |aspace: &mut AddressSpace, sp: &mut usize, bytes: &[u8]| -> Result<(), KernelError> {
        *sp = sp
            .checked_sub(bytes.len())
            .filter(|sp| *sp >= bottom)
            .ok_or(KernelError::InvalidArgument)?;
        aspace.write(va(*sp)?, bytes)
    };

    let mut addrs = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        push(aspace, &mut sp, &[0])?;
        push(aspace, &mut sp, arg.as_bytes())?;
        addrs.push(sp);
    }
    let pad = sp % 8;
    push(aspace, &mut sp, &alloc::vec![0u8; pad])?;
    push(aspace, &mut sp, &0u64.to_le_bytes())?;
    for addr in addrs {
        push(aspace, &mut sp, &(addr as u64).to_le_bytes())?;
    }
    push(aspace, &mut sp, &0u64.to_le_bytes())?;
    Ok(sp)
}
