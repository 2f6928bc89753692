use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Time-to-live requested for an insert.
///
/// # Variants
///
/// * `Default` - use the cache's configured expiry delay (which may itself
///   mean "never")
/// * `Never` - the entry does not expire regardless of configuration
/// * `Of(duration)` - the entry expires after the given duration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ttl {
    Default,
    Never,
    Of(Duration),
}

/// A single cache entry: the unit of storage.
///
/// Entries are exclusively owned by the cache that created them; they are
/// created on insert, mutated on update, and destroyed on remove or evict.
/// Touch metadata (`last_touch`, `touch_count`) is atomic so the read fast
/// path can register an access while holding the engine guard in shared
/// mode.
///
/// An expiry of `0` means the entry never expires. Units of `-1` mean the
/// entry has been discarded and no longer counts against the cache total.
#[derive(Debug)]
pub struct Entry<K, V> {
    key: K,
    value: V,
    created: u64,
    expiry: u64,
    last_touch: AtomicU64,
    touch_count: AtomicU32,
    units: i64,
}

impl<K, V> Entry<K, V> {
    /// Creates a new entry stamped with the given wall-clock millis.
    pub fn new(key: K, value: V, now: u64, expiry: u64, units: i64) -> Self {
        Self {
            key,
            value,
            created: now,
            expiry,
            last_touch: AtomicU64::new(now),
            touch_count: AtomicU32::new(0),
            units,
        }
    }

    /// The entry's key.
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The entry's current value.
    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Replaces the value, returning the previous one.
    pub fn replace_value(&mut self, value: V) -> V {
        std::mem::replace(&mut self.value, value)
    }

    /// Wall-clock millis when the entry was created.
    #[inline]
    pub fn created_millis(&self) -> u64 {
        self.created
    }

    /// Wall-clock millis of the expiry deadline; `0` means no expiry.
    #[inline]
    pub fn expiry_millis(&self) -> u64 {
        self.expiry
    }

    /// Re-arms or clears the expiry deadline.
    pub fn set_expiry_millis(&mut self, expiry: u64) {
        self.expiry = expiry;
    }

    /// True when the entry carries a deadline that has passed.
    #[inline]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expiry != 0 && now > self.expiry
    }

    /// Registers an access: bumps the touch count and the last-touch time.
    #[inline]
    pub fn touch(&self, now: u64) {
        self.touch_count.fetch_add(1, Ordering::Relaxed);
        self.last_touch.store(now, Ordering::Relaxed);
    }

    /// Wall-clock millis of the most recent access.
    #[inline]
    pub fn last_touch_millis(&self) -> u64 {
        self.last_touch.load(Ordering::Relaxed)
    }

    /// Number of accesses since creation (or since the last decay).
    #[inline]
    pub fn touch_count(&self) -> u32 {
        self.touch_count.load(Ordering::Relaxed)
    }

    /// Decays the touch count after a prune: `max(1, uses >> 4)`.
    ///
    /// Prevents long-lived entries from monopolizing the frequency score.
    pub fn decay_touches(&self) {
        let uses = self.touch_count.load(Ordering::Relaxed);
        self.touch_count.store((uses >> 4).max(1), Ordering::Relaxed);
    }

    /// The entry's unit cost, `-1` when discarded.
    #[inline]
    pub fn units(&self) -> i64 {
        self.units
    }

    /// Re-costs the entry (value replaced, different calculator output).
    pub fn set_units(&mut self, units: i64) {
        self.units = units;
    }

    /// Marks the entry discarded so it no longer counts against the cache.
    pub fn discard(&mut self) {
        self.units = -1;
    }

    /// True once the entry has been discarded by eviction.
    #[inline]
    pub fn is_discarded(&self) -> bool {
        self.units < 0
    }
}
