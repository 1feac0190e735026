//! Cross-thread blocking behaviour of `BoundedQueue`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use batchflow_core::FlowError;
use batchflow_queue::{BoundedQueue, QueueEnd};

#[test]
fn test_capacity_one_blocks_second_push_until_pop() {
    let q = Arc::new(BoundedQueue::new(1));
    let second_done = Arc::new(AtomicBool::new(false));

    let first = {
        let q = Arc::clone(&q);
        thread::spawn(move || q.push("first", QueueEnd::Tail))
    };
    first.join().unwrap().unwrap();

    let second = {
        let q = Arc::clone(&q);
        let done = Arc::clone(&second_done);
        thread::spawn(move || {
            q.push("second", QueueEnd::Tail).unwrap();
            done.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(
        !second_done.load(Ordering::SeqCst),
        "second push should block while the queue is full"
    );

    let popped_at = Instant::now();
    assert_eq!(q.pop(QueueEnd::Head).unwrap(), "first");
    second.join().unwrap();
    assert!(second_done.load(Ordering::SeqCst));
    assert!(
        popped_at.elapsed() < Duration::from_secs(1),
        "second push took too long to wake"
    );
    assert_eq!(q.pop(QueueEnd::Head).unwrap(), "second");
}

#[test]
fn test_pop_blocks_until_push() {
    let q: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));
    let consumer = {
        let q = Arc::clone(&q);
        thread::spawn(move || q.pop(QueueEnd::Head))
    };
    thread::sleep(Duration::from_millis(20));
    q.push(7, QueueEnd::Tail).unwrap();
    assert_eq!(consumer.join().unwrap().unwrap(), 7);
}

#[test]
fn test_pop_upto_n_does_not_wait_for_more() {
    let q = Arc::new(BoundedQueue::new(16));
    q.push_n([1, 2, 3], QueueEnd::Tail).unwrap();
    let start = Instant::now();
    let got = q.pop_upto_n(5, QueueEnd::Head).unwrap();
    assert_eq!(got, vec![1, 2, 3]);
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_force_pop_n_waits_for_all() {
    let q = Arc::new(BoundedQueue::new(16));
    let consumer = {
        let q = Arc::clone(&q);
        thread::spawn(move || q.force_pop_n(3, QueueEnd::Head))
    };
    for i in 0..3 {
        thread::sleep(Duration::from_millis(5));
        q.push(i, QueueEnd::Tail).unwrap();
    }
    assert_eq!(consumer.join().unwrap().unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_close_wakes_blocked_producer_and_consumer() {
    let full = Arc::new(BoundedQueue::new(1));
    full.push(0u8, QueueEnd::Tail).unwrap();
    let producer = {
        let q = Arc::clone(&full);
        thread::spawn(move || q.push(1, QueueEnd::Tail))
    };

    let empty: Arc<BoundedQueue<u8>> = Arc::new(BoundedQueue::new(1));
    let consumer = {
        let q = Arc::clone(&empty);
        thread::spawn(move || q.pop(QueueEnd::Head))
    };

    thread::sleep(Duration::from_millis(20));
    full.close();
    empty.close();

    assert!(matches!(producer.join().unwrap(), Err(FlowError::QueueClosed)));
    assert!(matches!(consumer.join().unwrap(), Err(FlowError::QueueClosed)));
}

#[test]
fn test_many_producers_many_consumers_conserve_items() {
    let q = Arc::new(BoundedQueue::new(4));
    let producers: Vec<_> = (0..4u64)
        .map(|p| {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0..250u64 {
                    q.push(p * 1000 + i, QueueEnd::Tail).unwrap();
                }
            })
        })
        .collect();
    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let q = Arc::clone(&q);
            thread::spawn(move || q.force_pop_n(250, QueueEnd::Head).unwrap())
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    let mut all: Vec<u64> = consumers
        .into_iter()
        .flat_map(|c| c.join().unwrap())
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 1000);
    assert!(q.empty());
}
