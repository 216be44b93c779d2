//! Scheduling and synchronization on kernel threads.
use minos::{
    LogLevel, SystemConfigurationBuilder, interrupt, println,
    sync::{ConditionVariable, DONATION_MAX_DEPTH, Lock, Mutex, Semaphore},
    thread::{self, Current, PRI_DEFAULT, PRI_MAX, PRI_MIN, ThreadBuilder, scheduler::TIME_SLICE},
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

fn boot(main: impl FnOnce() + Send + 'static) -> String {
    SystemConfigurationBuilder::new()
        .log_level(LogLevel::Quiet)
        .boot(main)
        .console
}

/// Waiters of a semaphore are released in priority order.
#[test]
fn semaphore_wakes_highest_priority_first() {
    let console = boot(|| {
        let sema = Arc::new(Semaphore::new(0));
        Current::set_priority(PRI_MIN);
        for i in 0..10 {
            let priority = PRI_DEFAULT - (i + 3) % 10 - 1;
            let sema = sema.clone();
            ThreadBuilder::new(format!("priority {priority}"))
                .priority(priority)
                .spawn(move || {
                    sema.down();
                    println!("Thread {} woke up.", Current::get_name());
                })
                .unwrap();
        }
        for _ in 0..10 {
            sema.up();
            println!("Back in main thread.");
        }
    });
    let expected: String = (21..=30)
        .rev()
        .map(|p| format!("Thread priority {p} woke up.\nBack in main thread.\n"))
        .collect();
    assert_eq!(console, expected);
}

/// Waiters of equal priority are released in arrival order.
#[test]
fn semaphore_is_fifo_among_equals() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let priorities: Vec<i32> = (0..24).map(|_| rng.gen_range(PRI_MIN + 1..=PRI_MIN + 4)).collect();

    let mut expected: Vec<(usize, i32)> = priorities.iter().copied().enumerate().collect();
    expected.sort_by_key(|(_, priority)| std::cmp::Reverse(*priority));
    let expected: String = expected
        .into_iter()
        .map(|(i, priority)| format!("waiter {i} at {priority}\n"))
        .collect();

    let console = boot(move || {
        let sema = Arc::new(Semaphore::new(0));
        Current::set_priority(PRI_MIN);
        for (i, priority) in priorities.into_iter().enumerate() {
            let sema = sema.clone();
            ThreadBuilder::new(format!("waiter {i}"))
                .priority(priority)
                .spawn(move || {
                    sema.down();
                    println!("{} at {}", Current::get_name(), Current::get_priority());
                })
                .unwrap();
        }
        assert_eq!(sema.waiters(), 24);
        for _ in 0..24 {
            sema.up();
        }
    });
    assert_eq!(console, expected);
}

/// `up` hands its unit to the woken waiter even if the waiter cannot run yet.
#[test]
fn semaphore_hands_the_unit_to_the_woken_waiter() {
    boot(|| {
        let sema = Arc::new(Semaphore::new(0));
        let woke = Arc::new(AtomicBool::new(false));
        let waiter = {
            let (sema, woke) = (sema.clone(), woke.clone());
            ThreadBuilder::new("waiter")
                .priority(PRI_DEFAULT + 1)
                .spawn(move || {
                    sema.down();
                    woke.store(true, Ordering::SeqCst);
                })
                .unwrap()
        };
        assert_eq!(sema.waiters(), 1, "The waiter should be blocked.");

        Current::set_priority(PRI_DEFAULT + 2);
        sema.up();
        assert!(
            !woke.load(Ordering::SeqCst),
            "A lower-priority waiter must not run yet."
        );
        assert_eq!(sema.value(), 0, "The unit belongs to the woken waiter.");
        assert!(!sema.try_down(), "Nobody may steal the unit of the waiter.");

        Current::set_priority(PRI_MIN);
        assert!(woke.load(Ordering::SeqCst), "The waiter should have run.");
        waiter.join();
    });
}

/// Spawning a thread that outranks the creator runs it at once.
#[test]
fn spawning_a_higher_priority_thread_preempts() {
    let console = boot(|| {
        println!("main: before spawn");
        ThreadBuilder::new("high")
            .priority(PRI_DEFAULT + 1)
            .spawn(|| println!("high: running"))
            .unwrap();
        ThreadBuilder::new("low")
            .priority(PRI_DEFAULT - 1)
            .spawn(|| println!("low: running"))
            .unwrap();
        println!("main: after spawn");
    });
    assert_eq!(
        console,
        "main: before spawn\nhigh: running\nmain: after spawn\nlow: running\n"
    );
}

/// Lowering its own priority below a ready thread yields.
#[test]
fn lowering_priority_yields_to_a_ready_thread() {
    let console = boot(|| {
        ThreadBuilder::new("peer")
            .priority(PRI_DEFAULT - 1)
            .spawn(|| println!("peer"))
            .unwrap();
        println!("before");
        Current::set_priority(PRI_DEFAULT - 2);
        println!("after");
    });
    assert_eq!(console, "before\npeer\nafter\n");
}

/// A waiter lends its priority to the holder; two waiters, the highest wins.
#[test]
fn donation_to_the_holder() {
    let console = boot(|| {
        let lock = Arc::new(Lock::new());
        lock.acquire();
        for (name, priority) in [("acquire1", PRI_DEFAULT + 1), ("acquire2", PRI_DEFAULT + 2)] {
            let lock = lock.clone();
            ThreadBuilder::new(name)
                .priority(priority)
                .spawn(move || {
                    lock.acquire();
                    println!("{name}: got the lock");
                    lock.release();
                    println!("{name}: done");
                })
                .unwrap();
            assert_eq!(
                Current::get_priority(),
                priority,
                "The holder should run at the priority of its best waiter."
            );
        }
        assert_eq!(thread::with_current(|th| th.donors().len()), 2);
        assert_eq!(thread::with_current(|th| th.base_priority()), PRI_DEFAULT);

        lock.release();
        println!("acquire2, acquire1 must already have finished, in that order.");
        assert_eq!(Current::get_priority(), PRI_DEFAULT);
        assert!(thread::with_current(|th| th.donors().is_empty()));
    });
    assert_eq!(
        console,
        "acquire2: got the lock\n\
         acquire2: done\n\
         acquire1: got the lock\n\
         acquire1: done\n\
         acquire2, acquire1 must already have finished, in that order.\n"
    );
}

/// Releasing one lock only gives back the donations received through it.
#[test]
fn donation_through_several_locks() {
    let console = boot(|| {
        let (a, b) = (Arc::new(Lock::new()), Arc::new(Lock::new()));
        a.acquire();
        b.acquire();
        for (name, lock, priority) in [
            ("a-waiter", a.clone(), PRI_DEFAULT + 1),
            ("b-waiter", b.clone(), PRI_DEFAULT + 2),
        ] {
            ThreadBuilder::new(name)
                .priority(priority)
                .spawn(move || {
                    lock.acquire();
                    println!("{name}: got the lock");
                    lock.release();
                })
                .unwrap();
        }
        assert_eq!(Current::get_priority(), PRI_DEFAULT + 2);

        b.release();
        println!("main: released b");
        assert_eq!(
            Current::get_priority(),
            PRI_DEFAULT + 1,
            "The donation through `a` must survive the release of `b`."
        );
        a.release();
        println!("main: released a");
        assert_eq!(Current::get_priority(), PRI_DEFAULT);
    });
    assert_eq!(
        console,
        "b-waiter: got the lock\nmain: released b\na-waiter: got the lock\nmain: released a\n"
    );
}

/// Donation propagates through a holder that is itself blocked.
#[test]
fn donation_is_nested() {
    let console = boot(|| {
        let (a, b) = (Arc::new(Lock::new()), Arc::new(Lock::new()));
        a.acquire();

        let medium = {
            let (a, b) = (a.clone(), b.clone());
            ThreadBuilder::new("medium")
                .priority(PRI_DEFAULT + 1)
                .spawn(move || {
                    b.acquire();
                    a.acquire();
                    println!("medium: got a at {}", Current::get_priority());
                    a.release();
                    Current::yield_now();
                    b.release();
                    Current::yield_now();
                    println!("medium: done");
                })
                .unwrap()
        };
        assert_eq!(Current::get_priority(), PRI_DEFAULT + 1);

        let high = {
            let b = b.clone();
            ThreadBuilder::new("high")
                .priority(PRI_DEFAULT + 2)
                .spawn(move || {
                    b.acquire();
                    println!("high: got b");
                    b.release();
                    println!("high: done");
                })
                .unwrap()
        };
        assert_eq!(
            Current::get_priority(),
            PRI_DEFAULT + 2,
            "The donation of `high` must reach the holder of `a` through `medium`."
        );

        a.release();
        println!("main: released a");
        assert_eq!(Current::get_priority(), PRI_DEFAULT);
        high.join();
        medium.join();
    });
    assert_eq!(
        console,
        "medium: got a at 33\nhigh: got b\nhigh: done\nmedium: done\nmain: released a\n"
    );
}

/// Donation follows a chain of holders up to the depth bound.
#[test]
fn donation_follows_a_chain() {
    const HOPS: usize = 7;
    let console = boot(|| {
        Current::set_priority(PRI_MIN);
        let locks: Arc<Vec<Lock>> = Arc::new((0..=HOPS).map(|_| Lock::new()).collect());
        locks[0].acquire();
        for i in 1..=HOPS {
            let locks = locks.clone();
            let priority = 3 * i as i32;
            ThreadBuilder::new(format!("chain {i}"))
                .priority(priority)
                .spawn(move || {
                    locks[i].acquire();
                    locks[i - 1].acquire();
                    println!("chain {i} got lock {}", i - 1);
                    locks[i - 1].release();
                    locks[i].release();
                    println!("chain {i} finished at {}", Current::get_priority());
                })
                .unwrap();
            assert_eq!(
                Current::get_priority(),
                priority,
                "The donation of chain {i} should reach the main thread."
            );
        }
        locks[0].release();
        assert_eq!(Current::get_priority(), PRI_MIN);
    });

    let mut expected = String::new();
    for i in 1..=HOPS {
        expected += &format!("chain {i} got lock {}\n", i - 1);
    }
    for i in (1..=HOPS).rev() {
        expected += &format!("chain {i} finished at {}\n", 3 * i);
    }
    assert_eq!(console, expected);
}

/// Donation stops after `DONATION_MAX_DEPTH` holders.
#[test]
fn donation_depth_is_bounded() {
    const HOPS: usize = DONATION_MAX_DEPTH + 1;
    boot(|| {
        Current::set_priority(PRI_MIN);
        let locks: Arc<Vec<Lock>> = Arc::new((0..=HOPS).map(|_| Lock::new()).collect());
        locks[0].acquire();
        let mut handles = Vec::new();
        for i in 1..=HOPS {
            let locks = locks.clone();
            let priority = 10 + i as i32;
            handles.push(
                ThreadBuilder::new(format!("chain {i}"))
                    .priority(priority)
                    .spawn(move || {
                        locks[i].acquire();
                        locks[i - 1].acquire();
                        locks[i - 1].release();
                        locks[i].release();
                    })
                    .unwrap(),
            );
            let reached = 10 + i.min(DONATION_MAX_DEPTH) as i32;
            assert_eq!(Current::get_priority(), reached);
        }
        assert_eq!(
            Current::get_priority(),
            10 + DONATION_MAX_DEPTH as i32,
            "A donation must not travel further than the depth bound."
        );
        assert!(Current::get_priority() <= PRI_MAX);

        locks[0].release();
        for handle in handles {
            assert_eq!(handle.join(), 0);
        }
        assert_eq!(Current::get_priority(), PRI_MIN);
    });
}

/// Setting the base priority keeps the donated one in effect.
#[test]
fn donation_survives_set_priority() {
    let console = boot(|| {
        let lock = Arc::new(Lock::new());
        lock.acquire();
        {
            let lock = lock.clone();
            ThreadBuilder::new("donor")
                .priority(PRI_DEFAULT + 10)
                .spawn(move || {
                    lock.acquire();
                    println!("donor: got the lock");
                    lock.release();
                })
                .unwrap();
        }
        Current::set_priority(PRI_DEFAULT - 10);
        assert_eq!(Current::get_priority(), PRI_DEFAULT + 10);
        assert_eq!(thread::with_current(|th| th.base_priority()), PRI_DEFAULT - 10);

        lock.release();
        println!("main: released");
        assert_eq!(Current::get_priority(), PRI_DEFAULT - 10);
    });
    assert_eq!(console, "donor: got the lock\nmain: released\n");
}

/// A lock handed to a waiter that has not run yet still receives donations.
#[test]
fn donation_reaches_the_thread_a_lock_was_handed_to() {
    let console = boot(|| {
        let lock = Arc::new(Lock::new());
        let gate = Arc::new(Semaphore::new(0));
        lock.acquire();

        let waiter = {
            let lock = lock.clone();
            ThreadBuilder::new("waiter")
                .spawn(move || {
                    lock.acquire();
                    println!("waiter: got the lock at {}", Current::get_priority());
                    lock.release();
                })
                .unwrap()
        };
        Current::yield_now();
        assert_eq!(lock.holder(), Some(Current::get_tid()));

        let medium = {
            let gate = gate.clone();
            ThreadBuilder::new("medium")
                .priority(PRI_DEFAULT + 4)
                .spawn(move || {
                    gate.down();
                    println!("medium: running");
                })
                .unwrap()
        };

        lock.release();
        assert!(
            lock.holder().is_some() && !lock.held_by_current(),
            "The lock belongs to the waiter as soon as it is released."
        );

        let high = {
            let (lock, gate) = (lock.clone(), gate.clone());
            ThreadBuilder::new("high")
                .priority(PRI_DEFAULT + 10)
                .spawn(move || {
                    gate.up();
                    lock.acquire();
                    println!("high: got the lock");
                    lock.release();
                })
                .unwrap()
        };
        waiter.join();
        medium.join();
        high.join();
        println!("main: done");
    });
    assert_eq!(
        console,
        "waiter: got the lock at 41
high: got the lock
medium: running
main: done
"
    );
}

/// `try_acquire` never sleeps and never donates.
#[test]
fn try_acquire_does_not_block_or_donate() {
    let console = boot(|| {
        let lock = Arc::new(Lock::new());
        assert!(lock.try_acquire());
        assert!(lock.held_by_current());

        let contender = {
            let lock = lock.clone();
            ThreadBuilder::new("contender")
                .priority(PRI_DEFAULT + 5)
                .spawn(move || {
                    assert!(!lock.try_acquire());
                    let holder = lock.holder().and_then(thread::get).unwrap();
                    assert_eq!(holder.priority(), PRI_DEFAULT);
                    assert!(holder.donors().is_empty());
                    println!("contender: the lock is busy");
                })
                .unwrap()
        };
        contender.join();
        assert_eq!(Current::get_priority(), PRI_DEFAULT);
        assert!(thread::with_current(|th| th.donors().is_empty()));
        lock.release();
        assert_eq!(lock.holder(), None);

        let taker = {
            let lock = lock.clone();
            ThreadBuilder::new("taker")
                .priority(PRI_DEFAULT + 5)
                .spawn(move || {
                    assert!(lock.try_acquire());
                    assert_eq!(lock.holder(), Some(Current::get_tid()));
                    println!("taker: got the lock");
                    lock.release();
                })
                .unwrap()
        };
        taker.join();
    });
    assert_eq!(console, "contender: the lock is busy\ntaker: got the lock\n");
}

/// Condition variable waiters are signaled in priority order.
#[test]
fn condition_variable_wakes_highest_priority_first() {
    let console = boot(|| {
        let lock = Arc::new(Lock::new());
        let cond = Arc::new(ConditionVariable::new());
        Current::set_priority(PRI_MIN);
        for i in 0..10 {
            let priority = PRI_DEFAULT - (i + 7) % 10 - 1;
            let (lock, cond) = (lock.clone(), cond.clone());
            ThreadBuilder::new(format!("priority {priority}"))
                .priority(priority)
                .spawn(move || {
                    lock.acquire();
                    cond.wait(&lock);
                    println!("Thread {} woke up.", Current::get_name());
                    lock.release();
                })
                .unwrap();
        }
        assert_eq!(cond.waiters(), 10);
        for _ in 0..10 {
            lock.acquire();
            println!("Signaling...");
            cond.signal(&*lock);
            lock.release();
        }
    });
    let expected: String = (21..=30)
        .rev()
        .map(|p| format!("Signaling...\nThread priority {p} woke up.\n"))
        .collect();
    assert_eq!(console, expected);
}

/// A waiter that received a donation while asleep is signaled first.
#[test]
fn condition_variable_accounts_for_donation() {
    let console = boot(|| {
        let (outer, inner) = (Arc::new(Lock::new()), Arc::new(Lock::new()));
        let cond = Arc::new(ConditionVariable::new());
        Current::set_priority(PRI_MIN);

        let a = {
            let (outer, inner, cond) = (outer.clone(), inner.clone(), cond.clone());
            ThreadBuilder::new("a")
                .priority(20)
                .spawn(move || {
                    inner.acquire();
                    outer.acquire();
                    cond.wait(&outer);
                    println!("a: signaled at {}", Current::get_priority());
                    outer.release();
                    inner.release();
                })
                .unwrap()
        };
        let b = {
            let (outer, cond) = (outer.clone(), cond.clone());
            ThreadBuilder::new("b")
                .priority(25)
                .spawn(move || {
                    outer.acquire();
                    cond.wait(&outer);
                    println!("b: signaled");
                    outer.release();
                })
                .unwrap()
        };
        let c = {
            let inner = inner.clone();
            ThreadBuilder::new("c")
                .priority(40)
                .spawn(move || {
                    inner.acquire();
                    println!("c: got inner");
                    inner.release();
                })
                .unwrap()
        };
        assert_eq!(cond.waiters(), 2);

        for _ in 0..2 {
            outer.acquire();
            cond.signal(&*outer);
            outer.release();
        }
        a.join();
        b.join();
        c.join();
    });
    assert_eq!(console, "a: signaled at 40\nc: got inner\nb: signaled\n");
}

/// A Mesa waiter re-checks its condition after every signal.
#[test]
fn condition_variable_wait_while() {
    let console = boot(|| {
        let state = Arc::new(Mutex::new(0usize));
        let cond = Arc::new(ConditionVariable::new());
        let consumer = {
            let (state, cond) = (state.clone(), cond.clone());
            ThreadBuilder::new("consumer")
                .priority(PRI_DEFAULT + 1)
                .spawn(move || {
                    let guard = cond.wait_while(&*state, |n| *n < 3);
                    println!("consumer saw {}", *guard);
                    guard.unlock();
                })
                .unwrap()
        };
        for _ in 0..3 {
            let mut guard = state.lock();
            *guard += 1;
            println!("producer: {}", *guard);
            cond.signal(&guard);
            guard.unlock();
        }
        consumer.join();
    });
    assert_eq!(console, "producer: 1\nproducer: 2\nproducer: 3\nconsumer saw 3\n");
}

/// Broadcast wakes every waiter.
#[test]
fn condition_variable_broadcast() {
    boot(|| {
        let lock = Arc::new(Lock::new());
        let cond = Arc::new(ConditionVariable::new());
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let (lock, cond) = (lock.clone(), cond.clone());
                ThreadBuilder::new(format!("waiter {i}"))
                    .priority(PRI_DEFAULT + 1)
                    .spawn(move || {
                        lock.acquire();
                        cond.wait(&lock);
                        lock.release();
                    })
                    .unwrap()
            })
            .collect();
        assert_eq!(cond.waiters(), 5);
        lock.acquire();
        cond.broadcast(&*lock);
        assert_eq!(cond.waiters(), 0);
        lock.release();
        for handle in handles {
            assert_eq!(handle.join(), 0);
        }
    });
}

/// A wake-up from an interrupt handler takes effect once the handler returns.
#[test]
fn wakeup_from_an_interrupt_handler_is_deferred() {
    const VECTOR: usize = 40;
    boot(|| {
        let sema = Arc::new(Semaphore::new(0));
        let woke = Arc::new(AtomicBool::new(false));
        let waiter = {
            let (sema, woke) = (sema.clone(), woke.clone());
            ThreadBuilder::new("waiter")
                .priority(PRI_DEFAULT + 1)
                .spawn(move || {
                    sema.down();
                    woke.store(true, Ordering::SeqCst);
                })
                .unwrap()
        };
        {
            let (sema, woke) = (sema.clone(), woke.clone());
            interrupt::register(VECTOR, move || {
                sema.up();
                assert!(
                    !woke.load(Ordering::SeqCst),
                    "A woken thread must not run inside the handler."
                );
            });
        }
        assert!(interrupt::raise(VECTOR));
        assert!(
            woke.load(Ordering::SeqCst),
            "The woken thread should run as soon as the handler returns."
        );
        waiter.join();
    });
}

/// The timer preempts a thread after its time slice.
#[test]
fn timer_preempts_after_a_time_slice() {
    boot(|| {
        let ran = Arc::new(AtomicBool::new(false));
        let peer = {
            let ran = ran.clone();
            ThreadBuilder::new("peer")
                .spawn(move || ran.store(true, Ordering::SeqCst))
                .unwrap()
        };
        for _ in 0..TIME_SLICE - 1 {
            assert!(interrupt::tick());
        }
        assert!(!ran.load(Ordering::SeqCst), "The time slice is not over yet.");
        assert!(interrupt::tick());
        assert!(ran.load(Ordering::SeqCst), "The peer should have run.");
        peer.join();
    });
}

#[test]
#[should_panic(expected = "acquires a lock it already holds")]
fn acquiring_a_held_lock_again_panics() {
    boot(|| {
        let lock = Lock::new();
        lock.acquire();
        lock.acquire();
    });
}

#[test]
#[should_panic(expected = "releases a lock it does not hold")]
fn releasing_a_foreign_lock_panics() {
    boot(|| {
        let lock = Arc::new(Lock::new());
        lock.acquire();
        let lock = lock.clone();
        ThreadBuilder::new("thief")
            .priority(PRI_DEFAULT + 1)
            .spawn(move || lock.release())
            .unwrap();
    });
}

#[test]
#[should_panic(expected = "Semaphore::down in an interrupt handler.")]
fn blocking_in_an_interrupt_handler_panics() {
    boot(|| {
        interrupt::register(41, || Semaphore::new(0).down());
        interrupt::raise(41);
    });
}
