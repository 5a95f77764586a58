//! Behavioral laws of the fiber runtime.
//!
//! Each test builds its own runtime and checks one observable guarantee:
//! join determinism, structured interruption, finalizer order, STM
//! atomicity and wake-up, queue strategies, and exit exhaustiveness.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tessel_runtime::scope::{acquire_release, scoped};
use tessel_runtime::{
    Deferred, Effect, Exit, Fiber, FiberStatus, Queue, Runtime, Stm, TRef,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runtime(workers: usize) -> Runtime {
    init_tracing();
    Runtime::builder().num_workers(workers).build().unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

// ============================================================================
// Fibers
// ============================================================================

#[test]
fn fork_join_matches_direct_run() {
    let rt = runtime(2);
    let programs: Vec<Effect<i32, String>> = vec![
        Effect::succeed(7),
        Effect::<i32, String>::succeed(20)
            .map(|n| n + 1)
            .flat_map(|n| Effect::sync(move || n * 2)),
        Effect::fail("nope".to_string()),
        Effect::<i32, String>::fail("retry".to_string()).catch_all(|_| Effect::succeed(3)),
    ];
    for program in programs {
        let direct = rt.run_sync_exit(program.clone());
        let joined = rt.run_sync_exit(program.fork().flat_map(|fiber: Fiber<i32, String>| fiber.join()));
        assert_eq!(direct, joined);
    }
}

#[test]
fn interrupting_parent_interrupts_children_and_clears_roots() {
    let rt = runtime(2);
    let child_handle: Deferred<Fiber<()>> = Deferred::new();
    let publish = child_handle.clone();
    let parent: Effect<()> = Effect::<()>::never()
        .fork()
        .flat_map(move |child: Fiber<()>| publish.succeed(child).zip_right(Effect::never()));

    let parent_fiber = rt.run_fork(parent);
    let child = rt.run_promise(child_handle.await_()).wait().unwrap();

    let parent_exit = rt
        .run_promise(parent_fiber.interrupt::<Infallible>())
        .wait()
        .unwrap();
    assert!(parent_exit.is_interrupted());

    let child_exit = child.unsafe_poll().expect("child finished before parent");
    assert!(child_exit.is_interrupted());
    assert!(wait_until(|| rt.roots_count() == 0));
}

#[test]
fn finalizers_run_in_reverse_acquisition_order() {
    let rt = runtime(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let resource = |name: &'static str, order: Arc<Mutex<Vec<String>>>| {
        let acquired = order.clone();
        acquire_release(
            Effect::sync(move || {
                acquired.lock().push(format!("acquire {}", name));
                name
            }),
            move |name, _exit| {
                let order = order.clone();
                Effect::sync(move || order.lock().push(format!("release {}", name)))
            },
        )
    };
    let (o1, o2) = (order.clone(), order.clone());
    let program: Effect<()> = scoped(resource("r1", o1).flat_map(move |_| resource("r2", o2.clone())).as_unit());
    rt.run_sync(program).unwrap();
    assert_eq!(
        *order.lock(),
        vec!["acquire r1", "acquire r2", "release r2", "release r1"]
    );
}

// ============================================================================
// STM
// ============================================================================

#[test]
fn concurrent_transactions_never_lose_updates() {
    let rt = runtime(4);
    for n in [1usize, 10, 1000] {
        let counter = TRef::new(0usize);
        let increment = counter.update::<Infallible>(|c| c + 1).commit();
        let all: Effect<Vec<()>> = Effect::for_each_par(0..n, move |_| increment.clone());
        rt.run_promise(all).wait().unwrap();
        let total = rt.run_sync(counter.get::<Infallible>().commit()).unwrap();
        assert_eq!(total, n);
    }
}

#[test]
fn retrying_transaction_wakes_on_commit() {
    let rt = runtime(2);
    let flag = TRef::new(0);
    let evaluations = Arc::new(Mutex::new(0usize));
    let counted = evaluations.clone();
    let reader = flag.clone();
    let blocked: Stm<i32> = Stm::sync(move || *counted.lock() += 1)
        .zip_right(reader.get())
        .flat_map(|n| Stm::check(n == 1).map_to(n));

    let waiter = rt.run_fork(blocked.commit());
    assert!(wait_until(|| flag.waiter_count() > 0));
    let before = *evaluations.lock();

    rt.run_sync(flag.set::<Infallible>(1).commit()).unwrap();
    let mut promise = rt.run_promise(waiter.join());
    let woke = promise.wait_timeout(Duration::from_secs(5));
    assert_eq!(woke.map(|r| r.unwrap()), Some(1));
    assert_eq!(*evaluations.lock(), before + 1);
}

// ============================================================================
// Queues
// ============================================================================

#[test]
fn back_pressure_offer_suspends_until_take() {
    let rt = runtime(2);
    let queue: Queue<&'static str> = rt.run_sync(Queue::bounded::<Infallible>(1)).unwrap();
    rt.run_sync(queue.offer::<Infallible>("a")).unwrap();
    let second = rt.run_fork(queue.offer::<Infallible>("b"));
    std::thread::sleep(Duration::from_millis(30));
    assert!(second.unsafe_poll().is_none());
    assert!(second.status().is_suspended());

    assert_eq!(rt.run_sync(queue.take::<Infallible>()).unwrap(), "a");
    assert!(rt.run_promise(second.join()).wait().unwrap());
    assert_eq!(rt.run_sync(queue.take::<Infallible>()).unwrap(), "b");
}

#[test]
fn dropping_offer_returns_false_immediately() {
    let rt = runtime(1);
    let queue: Queue<&'static str> = rt.run_sync(Queue::dropping::<Infallible>(1)).unwrap();
    let offers: Effect<(bool, bool)> = queue.offer("a").zip(queue.offer("b"));
    assert_eq!(rt.run_sync(offers).unwrap(), (true, false));
    assert_eq!(rt.run_sync(queue.take_all::<Infallible>()).unwrap(), vec!["a"]);
}

#[test]
fn sliding_offer_keeps_newest() {
    let rt = runtime(1);
    let queue: Queue<&'static str> = rt.run_sync(Queue::sliding::<Infallible>(1)).unwrap();
    rt.run_sync(queue.offer_all::<Infallible>(vec!["a", "b"])).unwrap();
    assert_eq!(rt.run_sync(queue.take_all::<Infallible>()).unwrap(), vec!["b"]);
}

#[test]
fn take_up_to_then_size() {
    let rt = runtime(1);
    let program: Effect<(Vec<i32>, isize)> = Queue::bounded(5).flat_map(|q: Queue<i32>| {
        q.offer(1)
            .zip_right(q.offer(2))
            .zip_right(q.offer(3))
            .zip_right(q.take_up_to(2))
            .zip(q.size())
    });
    assert_eq!(rt.run_sync(program).unwrap(), (vec![1, 2], 1));
}

// ============================================================================
// Timeouts and long chains
// ============================================================================

#[test]
fn timeout_surfaces_failure_without_waiting_for_deadline() {
    let rt = runtime(2);
    let start = Instant::now();
    let timed: Effect<Option<i32>, String> =
        Effect::<i32, String>::fail("boom".into()).timeout(Duration::from_millis(500));
    let exit = rt.run_promise(timed).wait_exit();
    assert_eq!(exit.cause().map(|c| c.failures().len()), Some(1));
    assert!(start.elapsed() < Duration::from_millis(400));
}

#[test]
fn cloned_long_chain_runs_like_the_original() {
    let rt = runtime(1);
    let mut chain: Effect<i32> = Effect::succeed(0);
    for _ in 0..20_000 {
        chain = chain.map(|n| n + 1);
    }
    let copy = chain.clone();
    drop(chain);
    assert_eq!(rt.run_sync(copy).unwrap(), 20_000);
}

// ============================================================================
// Exits
// ============================================================================

#[test]
fn every_run_ends_in_exactly_one_exit() {
    let rt = runtime(2);
    let programs: Vec<Effect<i32, String>> = vec![
        Effect::succeed(1),
        Effect::fail("typed".to_string()),
        Effect::die("defect"),
        Effect::interrupt(),
        Effect::<i32, String>::sync(|| panic!("boom")),
    ];
    for program in programs {
        match rt.run_promise_exit(program).wait() {
            Exit::Success(_) => {}
            Exit::Failure(cause) => assert!(!cause.is_empty()),
        }
    }
}

#[test]
fn live_fibers_are_running_or_recorded_as_suspended() {
    let rt = runtime(2);
    let gate: Deferred<()> = Deferred::new();
    let sleeper = rt.run_fork(Effect::<()>::sleep(Duration::from_secs(30)));
    let waiter = rt.run_fork(gate.await_());
    let joiner_target = sleeper.clone();
    let joiner = rt.run_fork(Effect::<()>::suspend(move || joiner_target.join()));

    assert!(wait_until(|| [&sleeper, &waiter, &joiner]
        .iter()
        .all(|f| f.status().is_suspended())));

    match joiner.status() {
        FiberStatus::Suspended { blocking_on, .. } => assert_eq!(blocking_on, sleeper.id()),
        other => panic!("joiner should be parked on the sleeper, got {:?}", other),
    }
    for fiber in [&sleeper, &waiter, &joiner] {
        match fiber.status() {
            FiberStatus::Running { .. } | FiberStatus::Suspended { .. } => {}
            FiberStatus::Done => panic!("fiber {} finished unexpectedly", fiber.id()),
        }
    }

    rt.run_sync(gate.succeed::<Infallible>(())).unwrap();
    assert!(rt.run_promise(waiter.join()).wait().is_ok());
    let exit = rt.run_promise(sleeper.interrupt::<Infallible>()).wait().unwrap();
    assert!(exit.is_interrupted());
    let joined = rt.run_promise_exit(joiner.join()).wait();
    assert!(joined.is_interrupted());
}
