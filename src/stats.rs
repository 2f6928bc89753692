use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics for monitoring access patterns and pruning behavior.
///
/// All counters use atomic operations with `Relaxed` ordering so recording
/// is cheap enough to sit on the hot path. The running averages are derived
/// from cumulative counters at read time rather than maintained separately.
///
/// # Examples
///
/// ```
/// use cachette::CacheStatistics;
///
/// let stats = CacheStatistics::new();
/// stats.record_hit(1);
/// stats.record_hit(0);
/// stats.record_miss(2);
///
/// assert_eq!(stats.hits(), 2);
/// assert_eq!(stats.misses(), 1);
/// assert_eq!(stats.total_gets(), 3);
/// assert!((stats.hit_rate() - 0.6666).abs() < 0.001);
/// ```
#[derive(Debug, Default)]
pub struct CacheStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    removes: AtomicU64,
    prunes: AtomicU64,
    hit_millis: AtomicU64,
    miss_millis: AtomicU64,
    put_millis: AtomicU64,
    prune_millis: AtomicU64,
    last_prune_millis: AtomicU64,
}

impl CacheStatistics {
    /// Creates a statistics block with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful lookup and the time it took.
    #[inline]
    pub fn record_hit(&self, elapsed_millis: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.hit_millis.fetch_add(elapsed_millis, Ordering::Relaxed);
    }

    /// Records a failed lookup (absent or expired) and the time it took.
    #[inline]
    pub fn record_miss(&self, elapsed_millis: u64) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.miss_millis.fetch_add(elapsed_millis, Ordering::Relaxed);
    }

    /// Records a completed insert or update and the time it took.
    #[inline]
    pub fn record_put(&self, elapsed_millis: u64) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.put_millis.fetch_add(elapsed_millis, Ordering::Relaxed);
    }

    /// Records a completed remove.
    #[inline]
    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed prune pass.
    #[inline]
    pub fn record_prune(&self, at_millis: u64, elapsed_millis: u64) {
        self.prunes.fetch_add(1, Ordering::Relaxed);
        self.prune_millis.fetch_add(elapsed_millis, Ordering::Relaxed);
        self.last_prune_millis.store(at_millis, Ordering::Relaxed);
    }

    /// Total number of cache hits.
    #[inline]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total number of cache misses.
    #[inline]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Total number of get operations (hits + misses).
    #[inline]
    pub fn total_gets(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Total number of puts (inserts and updates).
    #[inline]
    pub fn total_puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Total number of removes.
    #[inline]
    pub fn total_removes(&self) -> u64 {
        self.removes.load(Ordering::Relaxed)
    }

    /// Number of prune passes executed so far.
    #[inline]
    pub fn prune_count(&self) -> u64 {
        self.prunes.load(Ordering::Relaxed)
    }

    /// Wall-clock millis of the most recent prune, zero if never pruned.
    #[inline]
    pub fn last_prune_millis(&self) -> u64 {
        self.last_prune_millis.load(Ordering::Relaxed)
    }

    /// Hit rate as a fraction in `[0.0, 1.0]`; `0.0` with no accesses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_gets();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }

    /// Miss rate as a fraction in `[0.0, 1.0]`.
    pub fn miss_rate(&self) -> f64 {
        let total = self.total_gets();
        if total == 0 {
            0.0
        } else {
            1.0 - self.hit_rate()
        }
    }

    /// Average duration of a hit in milliseconds.
    pub fn average_hit_millis(&self) -> f64 {
        average(self.hit_millis.load(Ordering::Relaxed), self.hits())
    }

    /// Average duration of a miss in milliseconds.
    pub fn average_miss_millis(&self) -> f64 {
        average(self.miss_millis.load(Ordering::Relaxed), self.misses())
    }

    /// Average duration of a get, hits and misses combined.
    pub fn average_get_millis(&self) -> f64 {
        let total = self.hit_millis.load(Ordering::Relaxed) + self.miss_millis.load(Ordering::Relaxed);
        average(total, self.total_gets())
    }

    /// Average duration of a put in milliseconds.
    pub fn average_put_millis(&self) -> f64 {
        average(self.put_millis.load(Ordering::Relaxed), self.total_puts())
    }

    /// Average duration of a prune pass in milliseconds.
    pub fn average_prune_millis(&self) -> f64 {
        average(self.prune_millis.load(Ordering::Relaxed), self.prune_count())
    }

    /// Resets every counter to zero.
    ///
    /// Useful for measuring over a specific window or after a configuration
    /// change. Individual stores are not atomic as a group; concurrent
    /// recording during a reset may leave a partially-zeroed snapshot.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.puts.store(0, Ordering::Relaxed);
        self.removes.store(0, Ordering::Relaxed);
        self.prunes.store(0, Ordering::Relaxed);
        self.hit_millis.store(0, Ordering::Relaxed);
        self.miss_millis.store(0, Ordering::Relaxed);
        self.put_millis.store(0, Ordering::Relaxed);
        self.prune_millis.store(0, Ordering::Relaxed);
        self.last_prune_millis.store(0, Ordering::Relaxed);
    }
}

fn average(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}
