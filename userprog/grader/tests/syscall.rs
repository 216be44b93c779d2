//! System calls of a single process: arguments, files, console and the
//! boundary guard.
use minos::{
    Halt,
    addressing::{KERNEL_BASE, PAGE_SIZE},
    loader::{self, CODE_BASE, USER_STACK},
    user::{self, UserContext},
};
use minos_userprog::SyscallNumber;
use rand::{Rng, SeedableRng, rngs::StdRng};
use userprog_grader::{Grader, UserLib};

#[test]
fn hello() {
    let outcome = Grader::new()
        .program("hello", |ctx| {
            ctx.print("hello, world\n");
            0
        })
        .run("hello");
    assert_eq!(outcome.console, "hello, world\nhello: exit(0)\n");
    assert_eq!(outcome.exit_code, Some(0));
    outcome.assert_no_leak();
}

#[test]
fn args_are_passed_on_the_stack() {
    let outcome = Grader::new()
        .program("args", |ctx| {
            let argc = ctx.regs.gprs.rdi;
            let argv = ctx.regs.gprs.rsi;
            assert_eq!(ctx.regs.sp() % 8, 0, "Misaligned stack pointer.");
            assert!(ctx.regs.sp() < USER_STACK);
            assert_eq!(ctx.load_u64(argv + argc * 8), 0, "argv[argc] must be null.");
            for (i, arg) in ctx.args().into_iter().enumerate() {
                ctx.print(&format!("argv[{i}] = {arg}\n"));
            }
            argc as i32
        })
        .run("args  one two   three");
    assert_eq!(
        outcome.console,
        "argv[0] = args\nargv[1] = one\nargv[2] = two\nargv[3] = three\nargs: exit(4)\n"
    );
    assert_eq!(outcome.exit_code, Some(4));
    outcome.assert_no_leak();
}

#[test]
fn exit_reports_the_status() {
    let outcome = Grader::new()
        .program("status", |ctx| {
            ctx.print("before\n");
            ctx.exit(57);
        })
        .run("status");
    assert_eq!(outcome.console, "before\nstatus: exit(57)\n");
    assert_eq!(outcome.exit_code, Some(57));
    outcome.assert_no_leak();
}

#[test]
fn negative_exit_status() {
    let outcome = Grader::new()
        .program("negative", |ctx| ctx.exit(-17))
        .run("negative");
    assert_eq!(outcome.console, "negative: exit(-17)\n");
    assert_eq!(outcome.exit_code, Some(-17));
}

#[test]
fn long_names_are_truncated() {
    let outcome = Grader::new()
        .program("a-very-long-program-name", |_| 3)
        .run("a-very-long-program-name");
    assert_eq!(outcome.console, "a-very-long-prog: exit(3)\n");
}

#[test]
fn halt_powers_off() {
    let outcome = Grader::new()
        .program("halt", |ctx| {
            ctx.print("goodbye\n");
            ctx.halt();
        })
        .run("halt");
    assert_eq!(outcome.halt, Halt::PowerOff);
    assert_eq!(outcome.console, "goodbye\n");
    assert_eq!(outcome.exit_code, None);
}

#[test]
fn initd_must_be_an_executable() {
    let outcome = Grader::new().run("missing");
    assert_eq!(outcome.console, "run_initd: NoSuchEntry\n");
    assert_eq!(outcome.exit_code, None);
    outcome.assert_no_leak();

    let outcome = Grader::new().file("notes", b"plain text").run("notes arg");
    assert_eq!(outcome.console, "run_initd: NoExec\n");
    outcome.assert_no_leak();

    let outcome = Grader::new().program("blank", |_| 0).run("   ");
    assert_eq!(outcome.console, "run_initd: InvalidArgument\n");
    outcome.assert_no_leak();
}

#[test]
fn create_and_remove() {
    let outcome = Grader::new()
        .program("files", |ctx| {
            assert!(ctx.create("new", 10));
            assert!(!ctx.create("new", 0), "Created an existing file.");
            assert!(!ctx.create("fifteen-letters", 0), "Created a too long name.");
            assert!(!ctx.create("", 0), "Created an empty name.");
            assert!(ctx.create("fourteen-chars", 0));

            let fd = ctx.open("new");
            assert!(fd >= 2);
            assert_eq!(ctx.filesize(fd), 10);
            assert!(ctx.remove("new"));
            assert!(!ctx.remove("new"), "Removed a file twice.");
            assert_eq!(ctx.open("new"), -1);
            assert_eq!(ctx.read_bytes(fd, 16), Some(vec![0; 10]));
            ctx.close(fd);
            0
        })
        .run("files");
    assert_eq!(outcome.console, "files: exit(0)\n");
    assert!(!outcome.files.contains_key("new"));
    assert_eq!(outcome.files["fourteen-chars"], b"");
    outcome.assert_no_leak();
}

#[test]
fn open_missing_file() {
    let outcome = Grader::new()
        .program("open", |ctx| {
            assert_eq!(ctx.open("no-such-file"), -1);
            assert_eq!(ctx.open(""), -1);
            0
        })
        .run("open");
    assert_eq!(outcome.exit_code, Some(0));
    outcome.assert_no_leak();
}

#[test]
fn read_write_seek_tell() {
    let outcome = Grader::new()
        .file("data", b"0123456789")
        .program("rw", |ctx| {
            let fd = ctx.open("data");
            assert_eq!(ctx.filesize(fd), 10);
            assert_eq!(ctx.read_bytes(fd, 4).as_deref(), Some(&b"0123"[..]));
            assert_eq!(ctx.tell(fd), 4);

            ctx.seek(fd, 8);
            assert_eq!(ctx.read_bytes(fd, 10).as_deref(), Some(&b"89"[..]));
            assert_eq!(ctx.read_bytes(fd, 10).as_deref(), Some(&b""[..]));
            assert_eq!(ctx.tell(fd), 10);

            ctx.seek(fd, 2);
            assert_eq!(ctx.write_bytes(fd, b"ab"), 2);
            assert_eq!(ctx.tell(fd), 4);

            ctx.seek(fd, 12);
            assert_eq!(ctx.write_bytes(fd, b"XY"), 2);
            assert_eq!(ctx.filesize(fd), 14);

            let other = ctx.open("data");
            assert_ne!(other, fd);
            assert_eq!(ctx.tell(other), 0, "Descriptors share a cursor.");
            assert_eq!(ctx.read_bytes(other, 4).as_deref(), Some(&b"01ab"[..]));
            ctx.close(other);
            ctx.close(fd);

            assert_eq!(ctx.read_bytes(fd, 1), None);
            assert_eq!(ctx.write_bytes(fd, b"z"), -1);
            assert_eq!(ctx.filesize(fd), -1);
            assert_eq!(ctx.tell(fd), -1);
            0
        })
        .run("rw");
    assert_eq!(outcome.console, "rw: exit(0)\n");
    assert_eq!(outcome.files["data"], b"01ab456789\0\0XY");
    outcome.assert_no_leak();
}

#[test]
fn descriptors_reuse_the_lowest_free_slot() {
    let outcome = Grader::new()
        .file("data", b"data")
        .program("fds", |ctx| {
            let fds: Vec<isize> = (0..10).map(|_| ctx.open("data")).collect();
            assert_eq!(fds, (2..12).collect::<Vec<_>>());
            ctx.close(5);
            assert_eq!(ctx.open("data"), 5);
            assert_eq!(ctx.open("data"), 12);
            ctx.close(3);
            ctx.close(7);
            assert_eq!(ctx.open("data"), 3);
            assert_eq!(ctx.open("data"), 7);
            // Closing twice fails the second time.
            ctx.close(9);
            let buf = ctx.alloc(1);
            assert_eq!(ctx.syscall(SyscallNumber::Close as usize, [9, 0, 0, 0, 0, 0]), -1);
            assert_eq!(ctx.read(9, buf, 1), -1);
            0
        })
        .run("fds");
    assert_eq!(outcome.console, "fds: exit(0)\n");
    outcome.assert_no_leak();
}

#[test]
fn descriptor_table_is_bounded() {
    let outcome = Grader::new()
        .file("data", b"data")
        .program("fill", |ctx| {
            for expected in 2..128 {
                assert_eq!(ctx.open("data"), expected);
            }
            assert_eq!(ctx.open("data"), -1, "Opened past the table.");
            ctx.close(64);
            assert_eq!(ctx.open("data"), 64);
            assert_eq!(ctx.open("data"), -1);
            0
        })
        .run("fill");
    assert_eq!(outcome.console, "fill: exit(0)\n");
    // Exiting closes every descriptor.
    outcome.assert_no_leak();
}

#[test]
fn descriptors_never_alias() {
    let outcome = Grader::new()
        .file("data", b"data")
        .program("churn", |ctx| {
            let mut rng = StdRng::seed_from_u64(0xfd);
            let mut open: Vec<isize> = Vec::new();
            for _ in 0..600 {
                if open.is_empty() || (open.len() < 120 && rng.gen_bool(0.6)) {
                    let fd = ctx.open("data");
                    assert!((2..128).contains(&fd), "Bad descriptor {fd}.");
                    assert!(!open.contains(&fd), "Descriptor {fd} handed out twice.");
                    open.push(fd);
                } else {
                    let fd = open.swap_remove(rng.gen_range(0..open.len()));
                    ctx.close(fd);
                    let next = ctx.open("data");
                    assert!(next <= fd, "Descriptor {fd} was freed, got {next}.");
                    open.push(next);
                }
            }
            0
        })
        .run("churn");
    assert_eq!(outcome.exit_code, Some(0));
    outcome.assert_no_leak();
}

#[test]
fn wide_descriptors_are_rejected() {
    let outcome = Grader::new()
        .file("data", b"abcd")
        .program("wide", |ctx| {
            let fd = ctx.open("data");
            assert_eq!(fd, 2);
            let wide = (1 << 32) | fd;
            let buf = ctx.alloc(4);
            assert_eq!(ctx.read(wide, buf, 4), -1);
            assert_eq!(ctx.filesize(wide), -1);
            assert_eq!(ctx.tell(wide), -1);
            assert_eq!(ctx.syscall(SyscallNumber::Close as usize, [wide as usize, 0, 0, 0, 0, 0]), -1);
            // The real descriptor is still open.
            assert_eq!(ctx.read_bytes(fd, 4).as_deref(), Some(&b"abcd"[..]));
            0
        })
        .run("wide");
    assert_eq!(outcome.console, "wide: exit(0)\n");
    outcome.assert_no_leak();
}

#[test]
fn console_streams() {
    let outcome = Grader::new()
        .input(b"xyz")
        .program("stdio", |ctx| {
            let buf = ctx.alloc(8);
            assert_eq!(ctx.read(0, buf, 8), 3);
            let mut got = [0; 3];
            ctx.load(buf, &mut got);
            assert_eq!(&got, b"xyz");
            assert_eq!(ctx.read(0, buf, 8), 0);

            assert_eq!(ctx.write_bytes(0, b"stdin"), -1);
            assert_eq!(ctx.read(1, buf, 1), -1);
            assert_eq!(ctx.write_bytes(128, b"x"), -1);
            assert_eq!(ctx.write_bytes(-5, b"x"), -1);
            assert_eq!(ctx.filesize(0), -1);
            ctx.close(1);
            assert_eq!(ctx.write_bytes(1, b"still here\n"), 11);
            0
        })
        .run("stdio");
    assert_eq!(outcome.console, "still here\nstdio: exit(0)\n");
    outcome.assert_no_leak();
}

fn run_bad(case: fn(&mut UserContext)) {
    let outcome = Grader::new()
        .file("data", b"data")
        .program("bad", move |ctx| {
            case(ctx);
            ctx.print("survived\n");
            0
        })
        .run("bad");
    assert_eq!(outcome.console, "bad: exit(-1)\n");
    assert_eq!(outcome.exit_code, Some(-1));
    outcome.assert_no_leak();
}

#[test]
fn bad_string_pointers() {
    run_bad(|ctx| {
        ctx.syscall(SyscallNumber::Open as usize, [0, 0, 0, 0, 0, 0]);
    });
    run_bad(|ctx| {
        ctx.syscall(SyscallNumber::Open as usize, [KERNEL_BASE + 0x1000, 0, 0, 0, 0, 0]);
    });
    run_bad(|ctx| {
        ctx.syscall(SyscallNumber::Create as usize, [0x2000_0000, 0, 0, 0, 0, 0]);
    });
    run_bad(|ctx| {
        ctx.syscall(SyscallNumber::Exec as usize, [USER_STACK, 0, 0, 0, 0, 0]);
    });
    run_bad(|ctx| {
        ctx.syscall(SyscallNumber::Remove as usize, [usize::MAX, 0, 0, 0, 0, 0]);
    });
}

#[test]
fn bad_buffers() {
    // Reading into the read-only text page.
    run_bad(|ctx| {
        let fd = ctx.open("data");
        ctx.read(fd, CODE_BASE, 4);
    });
    // Writing from unmapped memory.
    run_bad(|ctx| {
        ctx.write(1, 0x1234_5000, 4);
    });
    // A buffer running off the top of the stack.
    run_bad(|ctx| {
        ctx.read(0, USER_STACK - 4, 8);
    });
    // A buffer wrapping around the address space.
    run_bad(|ctx| {
        ctx.write(1, USER_STACK - PAGE_SIZE, usize::MAX);
    });
    // Null buffer of length zero.
    run_bad(|ctx| {
        ctx.write(1, 0, 0);
    });
}

#[test]
fn bad_memory_accesses() {
    run_bad(|ctx| {
        ctx.load_u64(0);
    });
    run_bad(|ctx| {
        ctx.load_u64(KERNEL_BASE);
    });
    run_bad(|ctx| ctx.store(CODE_BASE, &[0xcc]));
    run_bad(|ctx| {
        let mut regs = ctx.regs;
        *regs.rip() = 0xdead_0000;
        user::launch(regs)
    });
}

#[test]
fn unknown_system_call() {
    run_bad(|ctx| {
        ctx.syscall(99, [0; 6]);
    });
    run_bad(|ctx| {
        ctx.syscall(usize::MAX, [0; 6]);
    });
}

#[test]
fn running_executable_is_read_only() {
    let outcome = Grader::new()
        .program("rox", |ctx| {
            let fd = ctx.open("rox");
            assert_eq!(ctx.write_bytes(fd, b"overwrite"), 0);
            assert_eq!(ctx.tell(fd), 0);
            ctx.close(fd);
            0
        })
        .run("rox");
    assert_eq!(outcome.console, "rox: exit(0)\n");
    assert_eq!(outcome.files["rox"], loader::image("rox"));
    outcome.assert_no_leak();
}

#[test]
fn executable_is_writable_after_exit() {
    let outcome = Grader::new()
        .program("victim", |ctx| {
            let fd = ctx.open("victim");
            ctx.write_bytes(fd, b"x") as i32 + 81
        })
        .program("rox-parent", |ctx| {
            let pid = ctx.fork("child", |ctx| {
                ctx.exec("victim");
                1
            });
            assert_eq!(ctx.wait(pid), 81);
            let fd = ctx.open("victim");
            let end = ctx.filesize(fd) as usize;
            ctx.seek(fd, end);
            assert_eq!(ctx.write_bytes(fd, b"!"), 1);
            0
        })
        .run("rox-parent");
    assert_eq!(outcome.console, "child: exit(81)\nrox-parent: exit(0)\n");
    let mut expected = loader::image("victim");
    expected.push(b'!');
    assert_eq!(outcome.files["victim"], expected);
    outcome.assert_no_leak();
}

#[test]
fn exec_replaces_the_image() {
    let outcome = Grader::new()
        .program("args", |ctx| {
            for arg in ctx.args() {
                ctx.print(&format!("{arg}\n"));
            }
            ctx.args().len() as i32
        })
        .program("exec-arg", |ctx| {
            ctx.print("before exec\n");
            ctx.exec("args childarg  second");
            ctx.print("exec returned\n");
            1
        })
        .run("exec-arg");
    assert_eq!(
        outcome.console,
        "before exec\nargs\nchildarg\nsecond\nexec-arg: exit(3)\n"
    );
    assert_eq!(outcome.exit_code, Some(3));
    outcome.assert_no_leak();
}

#[test]
fn failed_exec_returns() {
    let outcome = Grader::new()
        .file("notes", b"plain text")
        .program("args", |ctx| ctx.args().len() as i32)
        .program("exec-bad", |ctx| {
            assert_eq!(ctx.exec("no-such-program"), -1);
            assert_eq!(ctx.exec("notes"), -1);
            assert_eq!(ctx.exec(""), -1);
            let many = format!("args{}", " a".repeat(64));
            assert_eq!(ctx.exec(&many), -1);
            ctx.print("still running\n");
            0
        })
        .run("exec-bad");
    assert_eq!(outcome.console, "still running\nexec-bad: exit(0)\n");
    outcome.assert_no_leak();
}

#[test]
fn exec_keeps_open_files() {
    let outcome = Grader::new()
        .file("data", b"shared cursor")
        .program("reader", |ctx| {
            let fd: isize = ctx.args()[1].parse().unwrap();
            let data = ctx.read_bytes(fd, 64).unwrap();
            ctx.print(&format!("{}\n", String::from_utf8_lossy(&data)));
            0
        })
        .program("keeper", |ctx| {
            let fd = ctx.open("data");
            assert_eq!(ctx.read_bytes(fd, 7).as_deref(), Some(&b"shared "[..]));
            ctx.exec(&format!("reader {fd}"));
            1
        })
        .run("keeper");
    assert_eq!(outcome.console, "cursor\nkeeper: exit(0)\n");
    outcome.assert_no_leak();
}
