//! Integration tests for queues and hubs.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use tessel_runtime::scope::scoped;
use tessel_runtime::{Dequeue, Effect, Hub, Queue, Runtime, Subscription};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runtime() -> Runtime {
    init_tracing();
    Runtime::builder().num_workers(4).build().unwrap()
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
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
// Queue
// ============================================================================

#[test]
fn many_producers_one_consumer() {
    let rt = runtime();
    let queue: Queue<u32> = rt.run_sync(Queue::bounded::<Infallible>(8)).unwrap();

    let producer_queue = queue.clone();
    let producers = rt.run_fork(Effect::<Vec<bool>>::for_each_par(0..8u32, move |p| {
        producer_queue.offer_all((0..50).map(move |i| p * 1000 + i))
    }));

    let mut taken = rt.run_sync(queue.take_between::<Infallible>(400, 400)).unwrap();
    assert!(rt.run_promise(producers.join()).wait().unwrap().into_iter().all(|ok| ok));

    // Each producer's elements stay in its own offer order.
    for p in 0..8u32 {
        let own: Vec<u32> = taken.iter().copied().filter(|n| n / 1000 == p).collect();
        assert_eq!(own, (0..50).map(|i| p * 1000 + i).collect::<Vec<_>>());
    }
    taken.sort_unstable();
    taken.dedup();
    assert_eq!(taken.len(), 400);
}

#[test]
fn size_counts_parked_takers_as_negative() {
    let rt = runtime();
    let queue: Queue<i32> = rt.run_sync(Queue::unbounded::<Infallible>()).unwrap();
    let takers: Vec<_> = (0..3).map(|_| rt.run_fork(queue.take::<Infallible>())).collect();
    assert!(eventually(|| rt.run_sync(queue.size::<Infallible>()).unwrap() == -3));

    rt.run_sync(queue.offer_all::<Infallible>(vec![1, 2, 3])).unwrap();
    let mut values: Vec<i32> = takers
        .iter()
        .map(|t| rt.run_promise(t.join()).wait().unwrap())
        .collect();
    values.sort_unstable();
    assert_eq!(values, vec![1, 2, 3]);
    assert_eq!(rt.run_sync(queue.size::<Infallible>()).unwrap(), 0);
}

#[test]
fn shutdown_interrupts_parked_offers_and_takes() {
    let rt = runtime();
    let full: Queue<i32> = rt.run_sync(Queue::bounded::<Infallible>(1)).unwrap();
    rt.run_sync(full.offer::<Infallible>(1)).unwrap();
    let offer = rt.run_fork(full.offer::<Infallible>(2));

    let empty: Queue<i32> = rt.run_sync(Queue::unbounded::<Infallible>()).unwrap();
    let take = rt.run_fork(empty.take::<Infallible>());
    let watcher = rt.run_fork(empty.await_shutdown::<Infallible>());

    assert!(eventually(|| offer.status().is_suspended() && take.status().is_suspended()));
    rt.run_sync(full.shutdown::<Infallible>().zip_right(empty.shutdown())).unwrap();

    assert!(rt.run_promise_exit(offer.join()).wait().is_interrupted());
    assert!(rt.run_promise_exit(take.join()).wait().is_interrupted());
    assert!(rt.run_promise(watcher.join()).wait().is_ok());
    assert!(rt.run_sync_exit(empty.take::<Infallible>()).is_interrupted());
    assert!(rt.run_sync(full.is_shutdown::<Infallible>()).unwrap());
}

#[test]
fn interrupted_offer_leaves_no_trace() {
    let rt = runtime();
    let queue: Queue<i32> = rt.run_sync(Queue::bounded::<Infallible>(1)).unwrap();
    rt.run_sync(queue.offer::<Infallible>(1)).unwrap();
    let offer = rt.run_fork(queue.offer::<Infallible>(2));
    assert!(eventually(|| rt.run_sync(queue.size::<Infallible>()).unwrap() == 2));

    let exit = rt.run_promise(offer.interrupt::<Infallible>()).wait().unwrap();
    assert!(exit.is_interrupted());
    assert_eq!(rt.run_sync(queue.size::<Infallible>()).unwrap(), 1);
    assert_eq!(rt.run_sync(queue.take_all::<Infallible>()).unwrap(), vec![1]);
}

// ============================================================================
// Hub
// ============================================================================

#[test]
fn every_subscriber_sees_every_message_in_order() {
    let rt = runtime();
    let hub: Hub<u32> = rt.run_sync(Hub::bounded::<Infallible>(4)).unwrap();

    let read = |hub: Hub<u32>| {
        scoped(hub.subscribe::<Infallible>().flat_map(|sub: Subscription<u32>| sub.take_between(20, 20)))
    };
    let readers = rt.run_fork(read(hub.clone()).zip_par(read(hub.clone())).zip_par(read(hub.clone())));
    assert!(eventually(|| rt.run_sync(hub.subscriber_count::<Infallible>()).unwrap() == 3));

    assert!(rt.run_sync(hub.publish_all::<Infallible>(0..20)).unwrap());
    let ((a, b), c) = rt.run_promise(readers.join()).wait().unwrap();
    let expected: Vec<u32> = (0..20).collect();
    assert_eq!(a, expected);
    assert_eq!(b, expected);
    assert_eq!(c, expected);
    assert!(eventually(|| rt.run_sync(hub.subscriber_count::<Infallible>()).unwrap() == 0));
}

#[test]
fn slow_subscriber_back_pressures_publisher() {
    let rt = runtime();
    let hub: Hub<i32> = rt.run_sync(Hub::bounded::<Infallible>(2)).unwrap();
    let (sub_tx, sub_rx) = std::sync::mpsc::channel::<Subscription<i32>>();
    let holder = rt.run_fork(scoped(hub.subscribe::<Infallible>().flat_map(move |sub| {
        let _ = sub_tx.send(sub);
        Effect::<()>::never()
    })));
    let subscription = sub_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let publisher = rt.run_fork(hub.publish_all::<Infallible>(vec![1, 2, 3, 4]));
    assert!(eventually(|| publisher.status().is_suspended()));
    assert_eq!(rt.run_sync(hub.size::<Infallible>()).unwrap(), 2);

    let drained = rt.run_sync(subscription.take_between::<Infallible>(4, 4)).unwrap();
    assert_eq!(drained, vec![1, 2, 3, 4]);
    assert!(rt.run_promise(publisher.join()).wait().unwrap());

    rt.run_sync(holder.interrupt::<Infallible>()).unwrap();
    assert_eq!(rt.run_sync(hub.subscriber_count::<Infallible>()).unwrap(), 0);
}

#[test]
fn hub_shutdown_ends_subscribers_and_waiters() {
    let rt = runtime();
    let hub: Hub<i32> = rt.run_sync(Hub::unbounded::<Infallible>()).unwrap();
    let reader = rt.run_fork(scoped(
        hub.subscribe::<Infallible>().flat_map(|sub: Subscription<i32>| sub.take()),
    ));
    let waiter = rt.run_fork(hub.await_shutdown::<Infallible>());
    assert!(eventually(|| rt.run_sync(hub.subscriber_count::<Infallible>()).unwrap() == 1));

    rt.run_sync(hub.shutdown::<Infallible>()).unwrap();
    assert!(rt.run_promise_exit(reader.join()).wait().is_interrupted());
    assert!(rt.run_promise(waiter.join()).wait().is_ok());
    assert!(rt.run_sync(hub.is_shutdown::<Infallible>()).unwrap());
    assert!(rt.run_sync_exit(hub.publish::<Infallible>(1)).is_interrupted());
}
