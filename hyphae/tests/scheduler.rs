mod util;

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

#[test]
fn runs_many_coroutines() {
    const COROUTINES: usize = 100;
    const YIELDS: usize = 3;

    util::trace_init();
    let executor = util::executor();
    let completed = Rc::new(Cell::new(0));

    for i in 0..COROUTINES {
        let completed = completed.clone();
        executor.spawn(format!("worker-{i}"), move |co| {
            for _ in 0..YIELDS {
                co.yield_now();
            }
            completed.set(completed.get() + 1);
        });
    }
    assert_eq!(executor.allocated(), COROUTINES);

    executor.run();

    let stats = executor.stats();
    assert_eq!(completed.get(), COROUTINES);
    assert_eq!(executor.allocated(), 0);
    assert_eq!(stats.spawned, COROUTINES as u64);
    assert_eq!(stats.completed, COROUTINES as u64);
    assert_eq!(stats.switches, (COROUTINES * (YIELDS + 1)) as u64);
    // every coroutine yields in lockstep, so the whole batch takes one tick
    // per yield plus the tick in which they finish.
    assert_eq!(stats.ticks, (YIELDS + 1) as u64);
}

#[test]
fn yield_is_fair() {
    util::trace_init();
    let executor = util::executor();
    let log = Rc::new(RefCell::new(Vec::new()));

    for name in ["a", "b"] {
        let log = log.clone();
        executor.spawn(name, move |co| {
            for _ in 0..3 {
                log.borrow_mut().push(co.name().to_owned());
                co.yield_now();
            }
        });
    }

    executor.run();
    assert_eq!(*log.borrow(), vec!["a", "b", "a", "b", "a", "b"]);
}

#[test]
fn spawned_coroutines_run_next_tick() {
    util::trace_init();
    let executor = util::executor();
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        executor.execute(move |co| {
            let child = {
                let log = log.clone();
                co.spawn("child", move |_| log.borrow_mut().push("child"))
            };
            // the child does not run until this coroutine suspends.
            log.borrow_mut().push("parent");
            assert!(!child.is_finished());
            assert!(co.join(&child));
            log.borrow_mut().push("joined");
        });
    }

    assert_eq!(*log.borrow(), vec!["parent", "child", "joined"]);
    assert_eq!(executor.allocated(), 0);
}

#[test]
fn slots_are_reused() {
    util::trace_init();
    let executor = util::executor();

    let first = executor.spawn("first", |_| {});
    executor.run();
    assert!(first.is_finished());
    assert_eq!(executor.allocated(), 0);

    // the second coroutine lands in the first one's slot, but the old handle
    // must not see it.
    let second = executor.spawn("second", |co| {
        let _ = co.sleep_forever();
    });
    assert!(first.is_finished());
    assert!(!second.is_finished());
    assert_ne!(first, second);

    first.cancel();
    assert!(!second.is_cancelled());

    second.cancel();
    assert!(second.is_cancelled());
    executor.run();
    assert!(second.is_finished());
    assert_eq!(executor.allocated(), 0);
}

#[test]
fn stacks_are_reused() {
    util::trace_init();
    let executor = util::executor();
    let frames = Rc::new(RefCell::new(Vec::new()));

    for generation in 0..3 {
        let frames = frames.clone();
        executor.spawn(format!("generation-{generation}"), move |_| {
            let local = 0u8;
            frames.borrow_mut().push(std::ptr::addr_of!(local) as usize);
        });
        executor.run();
        // a stack-sized allocation between generations; a stack mapped anew
        // would not come back at the same address.
        let _filler = vec![0u8; 300 * 1024];
    }

    let frames = frames.borrow();
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|&frame| frame == frames[0]), "{frames:x?}");
    assert_eq!(executor.allocated(), 0);
}

#[test]
fn running_reports_the_current_coroutine() {
    util::trace_init();
    let executor = util::executor();
    assert_eq!(executor.running(), None);

    let seen = Rc::new(Cell::new(None));
    let expected = {
        let seen = seen.clone();
        executor.spawn("current", move |co| {
            assert!(co.is_running());
            seen.set(co.executor().running());
        })
    };

    executor.run();
    assert_eq!(seen.get(), Some(expected.id()));
    assert_eq!(executor.running(), None);
}

#[test]
#[should_panic(expected = "boom")]
fn panics_propagate_with_fail_on_error() {
    util::trace_init();
    let executor = util::executor();
    executor.spawn("bad", |co| {
        co.yield_now();
        panic!("boom");
    });
    executor.run();
}

#[test]
fn swallowed_panics_still_wake_joiners() {
    util::trace_init();
    let executor = util::executor();
    executor.set_fail_on_error(false);
    assert!(!executor.fail_on_error());

    let joined = Rc::new(Cell::new(false));
    let bad = executor.spawn("bad", |co| {
        co.yield_now();
        panic!("this panic is logged and swallowed");
    });
    {
        let joined = joined.clone();
        executor.spawn("joiner", move |co| joined.set(co.join(&bad)));
    }

    executor.run();
    assert!(joined.get());
    assert_eq!(executor.allocated(), 0);
    assert_eq!(executor.stats().completed, 2);
}

#[test]
fn exit_unwinds_and_wakes_joiners() {
    struct Guard(Rc<Cell<bool>>);
    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    util::trace_init();
    let executor = util::executor();
    let dropped = Rc::new(Cell::new(false));
    let after_exit = Rc::new(Cell::new(false));
    let joined = Rc::new(Cell::new(false));

    let exiting = {
        let dropped = dropped.clone();
        let after_exit = after_exit.clone();
        executor.spawn("exiting", move |co| {
            let _guard = Guard(dropped);
            co.yield_now();
            if !co.is_cancelled() {
                co.exit();
            }
            after_exit.set(true);
        })
    };
    {
        let joined = joined.clone();
        executor.spawn("joiner", move |co| joined.set(co.join(&exiting)));
    }

    executor.run();
    assert!(dropped.get(), "exit must run destructors");
    assert!(!after_exit.get(), "exit must not return");
    assert!(joined.get());
    assert_eq!(executor.allocated(), 0);
}

#[test]
#[should_panic(expected = "kept running after exit()")]
fn swallowed_exit_is_fatal() {
    util::trace_init();
    // without fail_on_error, so the panic cannot be coming from there.
    let executor = hyphae::Executor::builder()
        .stack_size(128 * 1024)
        .build()
        .expect("failed to create executor");

    executor.execute(|co| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| co.exit()));
        co.yield_now();
    });
}

#[test]
#[should_panic(expected = "kept running after exit()")]
fn returning_after_a_swallowed_exit_is_fatal() {
    util::trace_init();
    let executor = hyphae::Executor::builder()
        .stack_size(128 * 1024)
        .build()
        .expect("failed to create executor");

    executor.execute(|co| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| co.exit()));
    });
}
