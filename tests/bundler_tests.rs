use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use parking_lot::Mutex;

use cachette::{BundlerConfig, EntryBundler, KeyBundler};

/// One hundred concurrent single-entry inserts coalesce into a handful of
/// bulk calls, with every entry delivered exactly once.
#[test]
fn test_bundler_coalesces_hundred_inserts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(Mutex::new(Vec::new()));

    let bundler = {
        let calls = Arc::clone(&calls);
        let delivered = Arc::clone(&delivered);
        Arc::new(
            EntryBundler::new(
                BundlerConfig {
                    size_threshold: 50,
                    thread_threshold: 2,
                    delay_millis: 5,
                    auto_adjust: false,
                },
                move |batch: HashMap<u32, String>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    delivered.lock().extend(batch.into_keys());
                    // Fixed per-call latency, as with a real remote backend.
                    thread::sleep(std::time::Duration::from_millis(2));
                    Ok(())
                },
            )
            .unwrap(),
        )
    };

    let barrier = Arc::new(Barrier::new(100));
    let handles: Vec<_> = (0..100u32)
        .map(|i| {
            let bundler = Arc::clone(&bundler);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                bundler.process(i, format!("v{i}")).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut keys = delivered.lock().clone();
    keys.sort_unstable();
    assert_eq!(keys.len(), 100, "total delivered size must be 100");
    let expected: Vec<u32> = (0..100).collect();
    assert_eq!(keys, expected, "every key delivered exactly once");

    // With a threshold of 50 the hundred entries fit in a few bursts;
    // the first caller may slip through as a singleton before the
    // concurrency builds up.
    assert!(
        calls.load(Ordering::SeqCst) <= 6,
        "expected few bulk calls, saw {}",
        calls.load(Ordering::SeqCst)
    );
}

/// The read bundler hands each caller its own value out of the shared
/// burst result.
#[test]
fn test_read_bundler_shares_bulk_result() {
    let calls = Arc::new(AtomicUsize::new(0));
    let bundler = {
        let calls = Arc::clone(&calls);
        Arc::new(
            KeyBundler::new(
                BundlerConfig {
                    size_threshold: 64,
                    thread_threshold: 1,
                    delay_millis: 10,
                    auto_adjust: false,
                },
                move |keys: Vec<u32>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(keys.into_iter().map(|k| (k, format!("v{k}"))).collect())
                },
            )
            .unwrap(),
        )
    };

    let barrier = Arc::new(Barrier::new(32));
    let handles: Vec<_> = (0..32u32)
        .map(|i| {
            let bundler = Arc::clone(&bundler);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                bundler.process(i).unwrap()
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), Some(format!("v{i}")));
    }
    assert!(calls.load(Ordering::SeqCst) < 32);
}

/// Statistics accumulate across bursts and reset on demand.
#[test]
fn test_bundler_statistics_lifecycle() {
    let bundler = Arc::new(
        EntryBundler::new(
            BundlerConfig {
                size_threshold: 16,
                thread_threshold: 1,
                delay_millis: 5,
                auto_adjust: true,
            },
            |_batch: HashMap<u32, u32>| Ok(()),
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..8u32)
        .map(|i| {
            let bundler = Arc::clone(&bundler);
            thread::spawn(move || bundler.process(i, i).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = bundler.statistics();
    assert!(stats.burst_count >= 1);
    assert_eq!(stats.total_bundle_size, 8);
    assert!(stats.average_bundle_size() >= 1.0);
    assert!(stats.average_throughput() > 0.0);

    bundler.reset_statistics();
    let stats = bundler.statistics();
    assert_eq!(stats.burst_count, 0);
    assert_eq!(stats.total_bundle_size, 0);
}

/// The first auto-adjustment after a reset always probes the threshold
/// upward by a tenth (at least one unit), independent of measured
/// throughput.
#[test]
fn test_first_adjustment_probes_threshold_upward() {
    let bundler = EntryBundler::with_seed(
        BundlerConfig {
            size_threshold: 10,
            thread_threshold: 1,
            delay_millis: 1,
            auto_adjust: true,
        },
        42,
        |_batch: HashMap<u32, u32>| Ok(()),
    )
    .unwrap();

    assert_eq!(bundler.size_threshold(), 10);
    // 130 sequential bundling-path calls cross the 128-completion
    // adjustment boundary exactly once.
    for round in 0..130u32 {
        bundler.process(round, round).unwrap();
    }
    assert_eq!(bundler.size_threshold(), 11);

    // Resetting statistics also resets the adjustment baseline, so the
    // next cycle probes upward again.
    bundler.reset_statistics();
    for round in 0..130u32 {
        bundler.process(round, round).unwrap();
    }
    assert_eq!(bundler.size_threshold(), 12);
}
