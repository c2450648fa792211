//! Concurrent scenarios for the lock-free heterogeneous queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use heterokit::{MpmcLfQueue, MpscLfQueue};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Tagged {
    producer: u32,
    seq: u32,
}

#[test]
fn four_producers_one_consumer_drain() {
    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 10_000;

    let queue = Arc::new(MpscLfQueue::<heterokit::DefaultFeatures>::new());

    let mut producers = Vec::new();
    for producer in 0..PRODUCERS {
        let queue = Arc::clone(&queue);
        producers.push(thread::spawn(move || {
            for seq in 0..PER_PRODUCER {
                queue.push(Tagged { producer, seq });
            }
        }));
    }

    // Single consumer drains concurrently with the producers.
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut next_expected = [0u32; PRODUCERS as usize];
            let mut consumed = 0u64;
            while consumed < (PRODUCERS * PER_PRODUCER) as u64 {
                // SAFETY: this thread is the only consumer of an MPSC queue.
                if let Some(value) = unsafe { queue.try_pop_as::<Tagged>() } {
                    let expected = &mut next_expected[value.producer as usize];
                    assert_eq!(
                        value.seq, *expected,
                        "per-producer FIFO order violated"
                    );
                    *expected += 1;
                    consumed += 1;
                } else {
                    thread::yield_now();
                }
            }
            next_expected
        })
    };

    for handle in producers {
        handle.join().unwrap();
    }
    let next_expected = consumer.join().unwrap();
    assert!(next_expected.iter().all(|&n| n == PER_PRODUCER));
    // SAFETY: all threads joined; this is the only consumer now.
    unsafe { assert!(queue.empty()) };
}

#[test]
fn mpmc_multiset_is_preserved() {
    const PRODUCERS: u32 = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: u32 = 5_000;
    const TOTAL: usize = (PRODUCERS * PER_PRODUCER) as usize;

    let queue = Arc::new(MpmcLfQueue::<heterokit::DefaultFeatures>::new());
    let consumed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for producer in 0..PRODUCERS {
        let queue = Arc::clone(&queue);
        handles.push(thread::spawn(move || {
            for seq in 0..PER_PRODUCER {
                queue.push(Tagged { producer, seq });
            }
            Vec::new()
        }));
    }
    for _ in 0..CONSUMERS {
        let queue = Arc::clone(&queue);
        let consumed = Arc::clone(&consumed);
        handles.push(thread::spawn(move || {
            let mut mine = Vec::new();
            let mut last_seen: HashMap<u32, u32> = HashMap::new();
            while consumed.load(Ordering::Relaxed) < TOTAL {
                if let Some(value) = queue.try_pop_as::<Tagged>() {
                    // Within one consumer, each producer's elements arrive
                    // in increasing sequence order.
                    if let Some(&previous) = last_seen.get(&value.producer) {
                        assert!(value.seq > previous, "claim order violated");
                    }
                    last_seen.insert(value.producer, value.seq);
                    mine.push(value);
                    consumed.fetch_add(1, Ordering::Relaxed);
                } else {
                    thread::yield_now();
                }
            }
            mine
        }));
    }

    let mut tally: HashMap<(u32, u32), usize> = HashMap::new();
    for handle in handles {
        for value in handle.join().unwrap() {
            *tally.entry((value.producer, value.seq)).or_default() += 1;
        }
    }

    assert_eq!(tally.len(), TOTAL, "losses detected");
    assert!(
        tally.values().all(|&count| count == 1),
        "duplicates detected"
    );
    assert!(queue.empty());
}

#[test]
fn mixed_payload_sizes_under_contention() {
    const PER_PRODUCER: usize = 500;

    let queue = Arc::new(MpmcLfQueue::<heterokit::DefaultFeatures>::new());
    let consumed = Arc::new(AtomicUsize::new(0));
    let total = 2 * PER_PRODUCER;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let queue = Arc::clone(&queue);
        handles.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                if i % 7 == 0 {
                    // Too large for any 64 KiB page: external block path.
                    queue.push([i as u8; 70_000]);
                } else {
                    queue.push(i as u64);
                }
            }
        }));
    }

    let drainers: Vec<_> = (0..2)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let consumed = Arc::clone(&consumed);
            thread::spawn(move || {
                while consumed.load(Ordering::Relaxed) < total {
                    match queue.try_start_consume() {
                        Some(op) => {
                            if let Some(big) = op.downcast_ref::<[u8; 70_000]>() {
                                let tag = big[0];
                                assert!(big.iter().all(|&b| b == tag));
                            }
                            op.commit();
                            consumed.fetch_add(1, Ordering::Relaxed);
                        }
                        None => thread::yield_now(),
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    for handle in drainers {
        handle.join().unwrap();
    }
    assert!(queue.empty());
}

#[test]
fn concurrent_transactions_commit_atomically() {
    let queue = Arc::new(MpmcLfQueue::<heterokit::DefaultFeatures>::new());
    let barrier = Arc::new(std::sync::Barrier::new(3));

    let mut handles = Vec::new();
    for producer in 0..2u32 {
        let queue = Arc::clone(&queue);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for seq in 0..1000u32 {
                let txn = queue.start_push(Tagged { producer, seq });
                if seq % 3 == 0 {
                    txn.cancel();
                } else {
                    txn.commit();
                }
            }
        }));
    }

    let counter = {
        let queue = Arc::clone(&queue);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let mut seen = 0usize;
            let mut idle = 0;
            while idle < 1000 {
                if queue.try_pop_as::<Tagged>().is_some() {
                    seen += 1;
                    idle = 0;
                } else {
                    idle += 1;
                    thread::yield_now();
                }
            }
            seen
        })
    };

    for handle in handles {
        handle.join().unwrap();
    }
    let mut seen = counter.join().unwrap();
    while queue.try_pop_as::<Tagged>().is_some() {
        seen += 1;
    }
    // Of 1000 puts per producer, every third was cancelled.
    let expected_per_producer = (0..1000u32).filter(|seq| seq % 3 != 0).count();
    assert_eq!(seen, 2 * expected_per_producer);
}
