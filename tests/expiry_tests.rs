use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use cachette::{CacheEvent, CacheListener, EventKind, LocalCache, Ttl};

static TRACING: Once = Once::new();

/// Routes engine diagnostics (expiry sweeps, unit-accounting repairs)
/// into the test output, honoring `RUST_LOG`.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
struct DeleteLog {
    deletes: Mutex<Vec<CacheEvent<u32, String>>>,
    others: AtomicUsize,
}

impl CacheListener<u32, String> for DeleteLog {
    fn entry_inserted(&self, _event: &CacheEvent<u32, String>) {
        self.others.fetch_add(1, Ordering::SeqCst);
    }
    fn entry_updated(&self, _event: &CacheEvent<u32, String>) {
        self.others.fetch_add(1, Ordering::SeqCst);
    }
    fn entry_deleted(&self, event: &CacheEvent<u32, String>) {
        self.deletes.lock().push(event.clone());
    }
}

/// An expired entry reads as absent and its death is announced exactly
/// once, as a synthetic delete with the expired flag set.
#[test]
fn test_expired_get_is_absent_with_one_expired_delete() {
    init_tracing();
    let cache: LocalCache<u32, String> = LocalCache::builder("exp-single").build().unwrap();
    let log = Arc::new(DeleteLog::default());
    cache.add_listener(log.clone() as Arc<dyn CacheListener<u32, String>>, false, true);

    cache
        .insert_with_ttl(1, "v".into(), Ttl::Of(Duration::from_millis(10)))
        .unwrap();
    thread::sleep(Duration::from_millis(40));

    assert_eq!(cache.get(&1), None);
    assert_eq!(cache.get(&1), None);
    assert!(!cache.contains(&1));

    let deletes = log.deletes.lock();
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].synthetic);
    assert!(deletes[0].expired);
}

/// `expiry_delay = 0` with `Ttl::Default` means entries never expire.
#[test]
fn test_default_ttl_with_zero_delay_never_expires() {
    init_tracing();
    let cache: LocalCache<u32, String> = LocalCache::builder("exp-zero").build().unwrap();
    cache.insert(1, "v".into()).unwrap();
    thread::sleep(Duration::from_millis(40));
    assert_eq!(cache.get(&1), Some("v".to_string()));
}

/// A one-millisecond TTL makes the entry eligible immediately, but it
/// survives in the map until an access or an explicit eviction notices.
#[test]
fn test_short_ttl_survives_until_noticed() {
    init_tracing();
    let cache: LocalCache<u32, String> = LocalCache::builder("exp-short")
        .flush_delay(Duration::ZERO)
        .build()
        .unwrap();
    cache
        .insert_with_ttl(1, "v".into(), Ttl::Of(Duration::from_millis(1)))
        .unwrap();
    thread::sleep(Duration::from_millis(10));

    // Still physically present (peek sees through to liveness only).
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.peek(&1), None);

    // An explicit sweep retires it.
    cache.evict_expired().unwrap();
    assert_eq!(cache.len(), 0);
}

/// The lazy flush deadline retires every expired entry on the first
/// access past it, not just the accessed key.
#[test]
fn test_lazy_flush_sweeps_all_expired() {
    init_tracing();
    let cache: LocalCache<u32, String> = LocalCache::builder("exp-flush")
        .expiry_delay(Duration::from_millis(10))
        .flush_delay(Duration::from_millis(20))
        .build()
        .unwrap();
    let log = Arc::new(DeleteLog::default());
    cache.add_listener(log.clone() as Arc<dyn CacheListener<u32, String>>, false, true);

    for key in 1..=5 {
        cache.insert(key, format!("v{key}")).unwrap();
    }
    thread::sleep(Duration::from_millis(60));

    // One read past the deadline retires all five.
    assert_eq!(cache.get(&1), None);
    assert_eq!(cache.len(), 0);

    let deletes = log.deletes.lock();
    assert_eq!(deletes.len(), 5);
    assert!(deletes.iter().all(|event| event.synthetic && event.expired));
}

/// An insert over an expired slot announces the old entry's expiry before
/// the new insert, so listeners never see a silent resurrection.
#[test]
fn test_insert_over_expired_slot_announces_expiry_first() {
    init_tracing();
    let cache: LocalCache<u32, String> = LocalCache::builder("exp-overwrite").build().unwrap();
    let log = Arc::new(DeleteLog::default());

    cache
        .insert_with_ttl(1, "old".into(), Ttl::Of(Duration::from_millis(5)))
        .unwrap();
    thread::sleep(Duration::from_millis(20));

    cache.add_listener(log.clone() as Arc<dyn CacheListener<u32, String>>, false, true);
    cache.insert(1, "new".into()).unwrap();

    let deletes = log.deletes.lock();
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].expired);
    assert_eq!(deletes[0].old_value.as_deref(), Some("old"));
    // The follow-up event was a fresh insert, not an update.
    assert_eq!(log.others.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&1), Some("new".to_string()));
}

/// `Ttl::Never` pins an entry even when the cache has a default expiry.
#[test]
fn test_never_ttl_overrides_default() {
    init_tracing();
    let cache: LocalCache<u32, String> = LocalCache::builder("exp-never")
        .expiry_delay(Duration::from_millis(10))
        .flush_delay(Duration::from_millis(10))
        .build()
        .unwrap();

    cache.insert_with_ttl(1, "pinned".into(), Ttl::Never).unwrap();
    cache.insert(2, "fleeting".into()).unwrap();
    thread::sleep(Duration::from_millis(50));

    assert_eq!(cache.get(&1), Some("pinned".to_string()));
    assert_eq!(cache.get(&2), None);
}

/// Unit accounting stays balanced through expiry: retired entries give
/// their units back.
#[test]
fn test_units_returned_on_expiry() {
    init_tracing();
    let cache: LocalCache<u32, String> = LocalCache::builder("exp-units")
        .expiry_delay(Duration::from_millis(5))
        .flush_delay(Duration::ZERO)
        .build()
        .unwrap();

    for key in 0..10 {
        cache.insert(key, "v".into()).unwrap();
    }
    assert_eq!(cache.current_units(), 10);
    thread::sleep(Duration::from_millis(30));

    cache.evict_expired().unwrap();
    assert_eq!(cache.current_units(), 0);
    assert_eq!(cache.len(), 0);
}
