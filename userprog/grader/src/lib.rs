//! Grader for the MINOS process layer.
//!
//! A [`Grader`] describes one run of a machine: the user programs, the files
//! of the root filesystem and the boot configuration. [`Grader::run`] boots
//! the machine, starts the first process with a command line, waits for it
//! and for every process it left behind, and returns an [`Outcome`]: the
//! console transcript, the exit status of the first process and the kernel
//! resources still held at the end.
//!
//! ```rust
//! let outcome = Grader::new()
//!     .program("hello", |ctx| {
//!         ctx.print("hello, world\n");
//!         0
//!     })
//!     .run("hello");
//! assert_eq!(outcome.console, "hello, world\nhello: exit(0)\n");
//! ```
use minos::{
    Halt, LogLevel, SystemConfigurationBuilder,
    fs::FileSystem,
    loader, mm, println,
    thread::{self, Current, PRI_MIN},
    user::{self, UserContext},
};
use minos_userprog::process;
use ramfs::RamFs;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

pub use minos_userprog::ulib::UserLib;

/// Number of times the harness yields while waiting for leftover processes.
const SETTLE_ROUNDS: usize = 64;

type Program = Arc<dyn Fn(&mut UserContext) -> i32 + Send + Sync>;

/// Kernel resources still held once every process is gone.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Leaks {
    /// Records left in the process table.
    pub processes: usize,
    /// Pages left allocated.
    pub pages: usize,
    /// File handles left open.
    pub open_files: usize,
    /// Threads left alive, besides the harness itself.
    pub threads: usize,
    /// Fork continuations no child picked up.
    pub continuations: usize,
}

/// What a run leaves behind.
#[derive(Debug)]
pub struct Outcome {
    /// Why the machine stopped.
    pub halt: Halt,
    /// Everything printed on the console.
    pub console: String,
    /// Exit status of the first process, unless it could not start or the
    /// machine was powered off.
    pub exit_code: Option<i32>,
    /// Resources held at the end, unless the machine was powered off.
    pub leaks: Option<Leaks>,
    /// Content of every file at the end of the run.
    pub files: BTreeMap<String, Vec<u8>>,
}

impl Outcome {
    /// Lines of the console transcript.
    pub fn lines(&self) -> Vec<&str> {
        self.console.lines().collect()
    }

    /// Asserts that the run released every kernel resource.
    #[track_caller]
    pub fn assert_no_leak(&self) {
        assert_eq!(
            self.leaks,
            Some(Leaks::default()),
            "Kernel resources leaked. Console:\n{}",
            self.console
        );
    }
}

struct Settled {
    exit_code: Option<i32>,
    leaks: Leaks,
    files: BTreeMap<String, Vec<u8>>,
}

/// Builder of a machine run.
pub struct Grader {
    config: SystemConfigurationBuilder,
    programs: Vec<(String, Program)>,
    files: Vec<(String, Vec<u8>)>,
    open_limit: Option<usize>,
}

impl Default for Grader {
    fn default() -> Self {
        Self::new()
    }
}

impl Grader {
    /// Creates a run with no program and no file.
    pub fn new() -> Self {
        Self {
            config: SystemConfigurationBuilder::new().log_level(LogLevel::Quiet),
            programs: Vec::new(),
            files: Vec::new(),
            open_limit: None,
        }
    }

    /// Registers the program `name` and installs its executable under the
    /// same name.
    pub fn program(
        mut self,
        name: &str,
        program: impl Fn(&mut UserContext) -> i32 + Send + Sync + 'static,
    ) -> Self {
        self.programs.push((String::from(name), Arc::new(program)));
        self
    }

    /// Installs the file `name` with `data`.
    pub fn file(mut self, name: &str, data: &[u8]) -> Self {
        self.files.push((String::from(name), Vec::from(data)));
        self
    }

    /// Limits the number of pages of the machine.
    pub fn max_pages(mut self, n: usize) -> Self {
        self.config = self.config.max_pages(n);
        self
    }

    /// Limits the number of threads of the machine.
    pub fn max_threads(mut self, n: usize) -> Self {
        self.config = self.config.max_threads(n);
        self
    }

    /// Caps the number of simultaneously open file handles.
    pub fn open_limit(mut self, n: usize) -> Self {
        self.open_limit = Some(n);
        self
    }

    /// Preloads the keyboard.
    pub fn input(mut self, input: &[u8]) -> Self {
        self.config = self.config.input(input);
        self
    }

    /// Prints kernel logs down to `level` on the console.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config = self.config.log_level(level);
        self
    }

    /// Boots the machine and runs `cmdline` as the first process.
    pub fn run(self, cmdline: &str) -> Outcome {
        let Self {
            config,
            programs,
            files,
            open_limit,
        } = self;
        let slot: Arc<Mutex<Option<Settled>>> = Arc::default();
        let cmdline = String::from(cmdline);

        let report = config.boot({
            let slot = slot.clone();
            move || {
                minos_userprog::init();
                let fs = RamFs::new();
                for (name, program) in programs {
                    loader::register(&name, move |ctx| program(ctx));
                    fs.add_file(&name, &loader::image(&name))
                        .expect("Failed to install an executable.");
                }
                for (name, data) in files {
                    fs.add_file(&name, &data)
                        .expect("Failed to install a file.");
                }
                fs.set_open_limit(open_limit);
                FileSystem::register(fs.clone());

                let exit_code = match minos_userprog::run_initd(&cmdline) {
                    Ok(handle) => Some(handle.join()),
                    Err(e) => {
                        println!("run_initd: {e:?}");
                        None
                    }
                };
                settle();

                let leaks = Leaks {
                    processes: process::live_processes(),
                    pages: mm::allocated_pages(),
                    open_files: fs.open_handles(),
                    threads: thread::live_threads() - 1,
                    continuations: user::pending_continuations(),
                };
                let files = fs
                    .names()
                    .into_iter()
                    .filter_map(|name| fs.contents(&name).map(|data| (name, data)))
                    .collect();
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Settled {
                    exit_code,
                    leaks,
                    files,
                });
            }
        });

        let settled = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        let (exit_code, leaks, files) = match settled {
            Some(Settled {
                exit_code,
                leaks,
                files,
            }) => (exit_code, Some(leaks), files),
            None => (None, None, BTreeMap::new()),
        };
        Outcome {
            halt: report.halt,
            console: report.console,
            exit_code,
            leaks,
            files,
        }
    }
}

/// Lets every process the first one left behind run to completion.
fn settle() {
    Current::set_priority(PRI_MIN);
    for _ in 0..SETTLE_ROUNDS {
        if thread::live_threads() == 1 {
            break;
        }
        Current::yield_now();
    }
}
