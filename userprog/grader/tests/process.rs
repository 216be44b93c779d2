//! Fork, wait and exit across processes.
use minos::{interrupt, thread::scheduler::TIME_SLICE};
use userprog_grader::{Grader, UserLib};

#[test]
fn fork_returns_the_child_pid_and_zero() {
    let outcome = Grader::new()
        .program("parent", |ctx| {
            let pid = ctx.fork("child", |ctx| {
                assert_eq!(ctx.regs.gprs.rax, 0, "Child must see fork return 0.");
                ctx.print("child: run\n");
                81
            });
            assert!(pid > 0, "fork should return the pid of the child.");
            ctx.print("parent: forked\n");
            let status = ctx.wait(pid);
            ctx.print(&format!("parent: wait = {status}\n"));
            0
        })
        .run("parent");
    assert_eq!(
        outcome.console,
        "child: run\nchild: exit(81)\nparent: forked\nparent: wait = 81\nparent: exit(0)\n"
    );
    assert_eq!(outcome.exit_code, Some(0));
    outcome.assert_no_leak();
}

#[test]
fn wait_twice() {
    let outcome = Grader::new()
        .program("parent", |ctx| {
            let pid = ctx.fork("child", |_| 3);
            assert_eq!(ctx.wait(pid), 3);
            assert_eq!(ctx.wait(pid), -1, "A child can be waited for once.");
            0
        })
        .run("parent");
    assert_eq!(outcome.console, "child: exit(3)\nparent: exit(0)\n");
    outcome.assert_no_leak();
}

#[test]
fn wait_for_a_killed_child() {
    let outcome = Grader::new()
        .program("parent", |ctx| {
            let pid = ctx.fork("child", |ctx| {
                ctx.load_u64(0);
                ctx.print("child: survived\n");
                0
            });
            let status = ctx.wait(pid);
            ctx.print(&format!("parent: wait = {status}\n"));
            0
        })
        .run("parent");
    assert_eq!(
        outcome.console,
        "child: exit(-1)\nparent: wait = -1\nparent: exit(0)\n"
    );
    outcome.assert_no_leak();
}

#[test]
fn wait_for_a_stranger() {
    let outcome = Grader::new()
        .program("parent", |ctx| {
            assert_eq!(ctx.wait(9999), -1);
            assert_eq!(ctx.wait(-1), -1);
            assert_eq!(ctx.wait(0), -1);
            // The first process has pid 1 and is not its own child.
            assert_eq!(ctx.wait(1), -1);
            0
        })
        .run("parent");
    assert_eq!(outcome.console, "parent: exit(0)\n");
    outcome.assert_no_leak();
}

#[test]
fn grandchildren_are_not_children() {
    let outcome = Grader::new()
        .program("parent", |ctx| {
            let pid = ctx.fork("child", |ctx| {
                let grandchild = ctx.fork("grandchild", |_| 5);
                assert!(grandchild > 0);
                grandchild as i32
            });
            let grandchild = ctx.wait(pid);
            assert!(grandchild > 0);
            let status = ctx.wait(grandchild);
            ctx.print(&format!("parent: wait(grandchild) = {status}\n"));
            0
        })
        .run("parent");
    let lines = outcome.lines();
    assert!(lines.contains(&"grandchild: exit(5)"));
    assert!(lines.contains(&"parent: wait(grandchild) = -1"));
    assert_eq!(lines.last(), Some(&"parent: exit(0)"));
    outcome.assert_no_leak();
}

#[test]
fn wait_for_many_children() {
    let outcome = Grader::new()
        .program("parent", |ctx| {
            let pids: Vec<isize> = (0..4)
                .map(|i| ctx.fork(&format!("child {i}"), move |_| 10 + i))
                .collect();
            let statuses: Vec<isize> = pids.iter().rev().map(|pid| ctx.wait(*pid)).collect();
            assert_eq!(statuses, [13, 12, 11, 10]);
            statuses.iter().sum::<isize>() as i32
        })
        .run("parent");
    assert_eq!(
        outcome.console,
        "child 0: exit(10)\nchild 1: exit(11)\nchild 2: exit(12)\nchild 3: exit(13)\nparent: exit(46)\n"
    );
    outcome.assert_no_leak();
}

#[test]
fn orphan_outlives_its_parent() {
    let outcome = Grader::new()
        .program("parent", |ctx| {
            ctx.fork("child", |ctx| {
                ctx.print("child: start\n");
                // Run long enough for the timer to hand the CPU to the parent.
                for _ in 0..TIME_SLICE {
                    interrupt::tick();
                }
                ctx.print("child: done\n");
                0
            });
            ctx.print("parent: bye\n");
            0
        })
        .run("parent");
    assert_eq!(
        outcome.console,
        "child: start\nparent: bye\nparent: exit(0)\nchild: done\nchild: exit(0)\n"
    );
    assert_eq!(outcome.exit_code, Some(0));
    outcome.assert_no_leak();
}

#[test]
fn zombie_is_released_when_the_parent_exits() {
    let outcome = Grader::new()
        .program("parent", |ctx| {
            ctx.fork("child", |_| 7);
            ctx.print("parent: leaving\n");
            0
        })
        .run("parent");
    assert_eq!(
        outcome.console,
        "child: exit(7)\nparent: leaving\nparent: exit(0)\n"
    );
    outcome.assert_no_leak();
}

#[test]
fn child_gets_a_copy_of_memory() {
    let outcome = Grader::new()
        .program("parent", |ctx| {
            let buf = ctx.push_cstr("parent");
            let pid = ctx.fork("child", move |ctx| {
                assert_eq!(ctx.load_cstr(buf), "parent");
                ctx.store(buf, b"child\0");
                let seen = ctx.load_cstr(buf);
                ctx.print(&format!("child sees {seen}\n"));
                0
            });
            assert_eq!(ctx.wait(pid), 0);
            let seen = ctx.load_cstr(buf);
            ctx.print(&format!("parent sees {seen}\n"));
            0
        })
        .run("parent");
    assert_eq!(
        outcome.console,
        "child sees child\nchild: exit(0)\nparent sees parent\nparent: exit(0)\n"
    );
    outcome.assert_no_leak();
}

#[test]
fn child_gets_independent_files() {
    let outcome = Grader::new()
        .file("data", b"abcdefghi")
        .program("parent", |ctx| {
            let fd = ctx.open("data");
            assert_eq!(ctx.read_bytes(fd, 3).as_deref(), Some(&b"abc"[..]));
            let pid = ctx.fork("child", move |ctx| {
                let data = ctx.read_bytes(fd, 3).unwrap();
                ctx.print(&format!("child read {}\n", String::from_utf8_lossy(&data)));
                ctx.close(fd);
                assert_eq!(ctx.read_bytes(fd, 3), None);
                0
            });
            assert_eq!(ctx.wait(pid), 0);
            let data = ctx.read_bytes(fd, 3).unwrap();
            ctx.print(&format!("parent read {}\n", String::from_utf8_lossy(&data)));
            0
        })
        .run("parent");
    assert_eq!(
        outcome.console,
        "child read def\nchild: exit(0)\nparent read def\nparent: exit(0)\n"
    );
    outcome.assert_no_leak();
}

#[test]
fn fork_fails_without_memory() {
    // The first process takes 6 pages; a copy does not fit.
    let outcome = Grader::new()
        .max_pages(8)
        .program("parent", |ctx| {
            let pid = ctx.fork("child", |ctx| {
                ctx.print("child: run\n");
                0
            });
            ctx.print(&format!("parent: fork = {pid}\n"));
            0
        })
        .run("parent");
    assert_eq!(
        outcome.console,
        "child: exit(-1)\nparent: fork = -1\nparent: exit(0)\n"
    );
    assert_eq!(outcome.exit_code, Some(0));
    outcome.assert_no_leak();
}

#[test]
fn fork_copies_files_all_or_nothing() {
    // The executable and "data" are open; the child can reopen only one.
    let outcome = Grader::new()
        .file("data", b"abcdefgh")
        .open_limit(3)
        .program("parent", |ctx| {
            let fd = ctx.open("data");
            let pid = ctx.fork("child", |_| 0);
            ctx.print(&format!("parent: fork = {pid}\n"));
            let data = ctx.read_bytes(fd, 4).unwrap();
            ctx.print(&format!("parent: read {}\n", String::from_utf8_lossy(&data)));
            0
        })
        .run("parent");
    assert_eq!(
        outcome.console,
        "child: exit(-1)\nparent: fork = -1\nparent: read abcd\nparent: exit(0)\n"
    );
    outcome.assert_no_leak();
}

#[test]
fn fork_fails_without_threads() {
    // The harness and the first process use both threads.
    let outcome = Grader::new()
        .max_threads(2)
        .program("parent", |ctx| {
            let pid = ctx.fork("child", |_| 0);
            ctx.print(&format!("parent: fork = {pid}\n"));
            0
        })
        .run("parent");
    assert_eq!(outcome.console, "parent: fork = -1\nparent: exit(0)\n");
    outcome.assert_no_leak();
}

#[test]
fn child_can_exec() {
    let outcome = Grader::new()
        .program("args", |ctx| ctx.args().len() as i32)
        .program("parent", |ctx| {
            let pid = ctx.fork("runner", |ctx| {
                ctx.exec("args one two");
                -2
            });
            let status = ctx.wait(pid);
            ctx.print(&format!("parent: wait = {status}\n"));
            0
        })
        .run("parent");
    assert_eq!(
        outcome.console,
        "runner: exit(3)\nparent: wait = 3\nparent: exit(0)\n"
    );
    outcome.assert_no_leak();
}

#[test]
fn fork_tree() {
    fn spawn(ctx: &mut minos::user::UserContext, depth: i32) -> i32 {
        if depth == 0 {
            return 1;
        }
        let mut total = 1;
        for side in ["l", "r"] {
            let pid = ctx.fork(&format!("{side}{depth}"), move |ctx| spawn(ctx, depth - 1));
            total += ctx.wait(pid) as i32;
        }
        total
    }

    let outcome = Grader::new()
        .program("tree", |ctx| spawn(ctx, 3))
        .run("tree");
    // A binary tree of depth 3 has 15 nodes.
    assert_eq!(outcome.exit_code, Some(15));
    assert_eq!(outcome.lines().len(), 15);
    outcome.assert_no_leak();
}
