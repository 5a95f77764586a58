//! Integration tests for software transactional memory.

use std::convert::Infallible;
use std::time::Duration;

use tessel_runtime::{Effect, Runtime, Stm, TArray, THub, TQueue, TRef, TSubscription};

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

fn transfer(from: &TRef<i64>, to: &TRef<i64>, amount: i64) -> Stm<(), String> {
    let (from, to) = (from.clone(), to.clone());
    from.get().flat_map(move |balance| {
        if balance < amount {
            return Stm::fail(format!("insufficient funds: {} < {}", balance, amount));
        }
        from.set(balance - amount).zip_right(to.update(move |b| b + amount))
    })
}

#[test]
fn transfers_conserve_total_balance() {
    let rt = runtime();
    let accounts: Vec<TRef<i64>> = (0..5).map(|_| TRef::new(100)).collect();
    let moves: Vec<(usize, usize, i64)> = (0..200).map(|i| (i % 5, (i * 3 + 1) % 5, (i % 7) as i64 + 1)).collect();

    let accts = accounts.clone();
    let all: Effect<Vec<()>> = Effect::for_each_par(moves, move |(from, to, amount)| {
        transfer(&accts[from], &accts[to], amount)
            .commit()
            .catch_all(|_| Effect::unit())
    });
    rt.run_sync(all).unwrap();

    let read = accounts.clone();
    let balances: Stm<Vec<i64>> = Stm::for_each(0..read.len(), move |i| read[i].get());
    let balances = rt.run_sync(balances.commit()).unwrap();
    assert_eq!(balances.iter().sum::<i64>(), 500);
    assert!(balances.iter().all(|b| *b >= 0));
}

#[test]
fn failed_transfer_leaves_balances_untouched() {
    let rt = runtime();
    let a = TRef::new(10i64);
    let b = TRef::new(0i64);
    let exit = rt.run_sync(transfer(&a, &b, 50).commit());
    assert_eq!(exit.unwrap_err().failure(), Some(&"insufficient funds: 10 < 50".to_string()));
    let both: Stm<(i64, i64)> = a.get().zip(b.get());
    assert_eq!(rt.run_sync(both.commit()).unwrap(), (10, 0));
}

#[test]
fn or_else_takes_from_whichever_queue_has_data() {
    let rt = runtime();
    let setup: Stm<(TQueue<&'static str>, TQueue<&'static str>)> =
        TQueue::unbounded().zip(TQueue::unbounded());
    let (first, second) = rt.run_sync(setup.commit()).unwrap();
    rt.run_sync(second.offer::<Infallible>("from second").commit()).unwrap();

    let either: Stm<&'static str> = first.take::<Infallible>().or_else(second.take());
    assert_eq!(rt.run_sync(either.commit()).unwrap(), "from second");

    let waiting = rt.run_fork(first.take::<Infallible>().or_else(second.take::<Infallible>()).commit());
    std::thread::sleep(Duration::from_millis(20));
    assert!(waiting.unsafe_poll().is_none());
    rt.run_sync(first.offer::<Infallible>("from first").commit()).unwrap();
    assert_eq!(rt.run_promise(waiting.join()).wait().unwrap(), "from first");
}

#[test]
fn producers_and_consumers_share_a_tqueue() {
    let rt = runtime();
    let queue: TQueue<u32> = rt.run_sync(TQueue::bounded::<Infallible>(4).commit()).unwrap();

    let producer_queue = queue.clone();
    let producers: Effect<Vec<()>> = Effect::for_each_par(0..4u32, move |p| {
        let q = producer_queue.clone();
        Effect::for_each(0..25u32, move |i| q.offer(p * 100 + i).commit()).as_unit()
    });
    let consumer_queue = queue.clone();
    let consumers: Effect<Vec<Vec<u32>>> = Effect::for_each_par(0..2, move |_| {
        let q = consumer_queue.clone();
        Effect::for_each(0..50, move |_| q.take().commit())
    });

    let (_, taken) = rt.run_sync(producers.zip_par(consumers)).unwrap();
    let mut all: Vec<u32> = taken.into_iter().flatten().collect();
    all.sort_unstable();
    let mut expected: Vec<u32> = (0..4).flat_map(|p| (0..25).map(move |i| p * 100 + i)).collect();
    expected.sort_unstable();
    assert_eq!(all, expected);
}

#[test]
fn thub_delivers_to_every_subscriber() {
    let rt = runtime();
    let hub: THub<i32> = rt.run_sync(THub::bounded::<Infallible>(2).commit()).unwrap();
    let subscribe: Stm<(TSubscription<i32>, TSubscription<i32>)> = hub.subscribe().zip(hub.subscribe());
    let (left, right) = rt.run_sync(subscribe.commit()).unwrap();

    let reader = |sub: TSubscription<i32>| Effect::for_each(0..5, move |_| sub.take::<Infallible>().commit());
    let readers: Effect<(Vec<i32>, Vec<i32>)> = reader(left).zip_par(reader(right));
    let reading = rt.run_fork(readers);

    let publisher = hub.clone();
    let publish: Effect<Vec<bool>> = Effect::for_each(1..=5, move |n| publisher.publish(n).commit());
    assert_eq!(rt.run_sync(publish).unwrap(), vec![true; 5]);

    let (l, r) = rt.run_promise(reading.join()).wait().unwrap();
    assert_eq!(l, vec![1, 2, 3, 4, 5]);
    assert_eq!(r, l);
}

#[test]
fn tarray_swap_is_atomic() {
    let rt = runtime();
    let array = TArray::from_vec((0..8).collect::<Vec<i32>>());
    let swapper = array.clone();
    let swaps: Effect<Vec<()>> = Effect::for_each_par(0..100usize, move |i| {
        let (a, b) = (i % 8, (i * 5 + 3) % 8);
        let arr = swapper.clone();
        arr.get(a)
            .zip(arr.get(b))
            .flat_map(move |(x, y)| arr.set(a, y).zip_right(arr.set(b, x)))
            .commit()
    });
    rt.run_sync(swaps).unwrap();
    let mut values = rt.run_sync(array.to_vec::<Infallible>().commit()).unwrap();
    values.sort_unstable();
    assert_eq!(values, (0..8).collect::<Vec<_>>());
}
