use std::collections::hash_map::Entry as Slot;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::entry::{Entry, Ttl};
use crate::error::{CacheError, Result};
use crate::eviction::{
    select_hybrid, select_lfu, select_lru, EvictionCandidate, EvictionContext, EvictionPolicyKind,
};
use crate::extractor::ValueExtractor;
use crate::filter::Filter;
use crate::index::{CacheIndex, IndexMap, SimpleCacheIndex};
use crate::listener::{CacheEvent, CacheListener, EventKind, EventTransformer, ListenerRegistry};
use crate::loader::{CacheLoader, CacheStore};
use crate::lock_manager::KeyLockManager;
use crate::processor::{Aggregator, EntryProcessor, InvocableEntry, InvocationOutcome};
use crate::stats::CacheStatistics;
use crate::stats_registry;
use crate::time::safe_time_millis;
use crate::trigger::{CacheTrigger, PendingAction, TriggerEntry};
use crate::units::UnitCalculatorKind;

/// Default background-flush interval applied when an expiry delay is
/// configured without an explicit flush delay.
const DEFAULT_FLUSH_MILLIS: u64 = 60_000;

/// Which keys a mutation context hides from the write-through path, and
/// whether the mutation is synthetic (engine-generated) or expiry-driven.
///
/// This is the explicit, call-scoped replacement for a thread-local mask:
/// the engine threads it through its internal mutation calls, so loader
/// inserts never echo back into the backing store.
#[derive(Clone, Debug)]
pub(crate) struct KeyMask<K> {
    synthetic: bool,
    expired: bool,
    suppressed: Option<Arc<HashSet<K>>>,
}

impl<K: Eq + Hash> KeyMask<K> {
    fn user() -> Self {
        Self {
            synthetic: false,
            expired: false,
            suppressed: None,
        }
    }

    fn synthetic() -> Self {
        Self {
            synthetic: true,
            expired: false,
            suppressed: None,
        }
    }

    fn expiry() -> Self {
        Self {
            synthetic: true,
            expired: true,
            suppressed: None,
        }
    }

    /// Mask for entries materialized by a loader: synthetic, and the
    /// given keys never write through.
    fn load(keys: HashSet<K>) -> Self {
        Self {
            synthetic: true,
            expired: false,
            suppressed: Some(Arc::new(keys)),
        }
    }

    fn ignores(&self, key: &K) -> bool {
        match &self.suppressed {
            Some(keys) => keys.contains(key),
            None => false,
        }
    }
}

/// Guarded engine state: the entry map plus everything that must move in
/// the same exclusive section (unit accounting, indexes, triggers, flush
/// and prune bookkeeping).
struct CacheInner<K, V> {
    map: HashMap<K, Entry<K, V>>,
    units: i64,
    next_flush: u64,
    last_prune: u64,
    avg_touch: u64,
    indexes: IndexMap<K, V>,
    triggers: Vec<Arc<dyn CacheTrigger<K, V>>>,
}

/// Builder for [`LocalCache`]; see the builder methods for defaults.
pub struct LocalCacheBuilder<K, V> {
    name: String,
    high_units: i64,
    low_units: Option<i64>,
    prune_level: f64,
    expiry_delay_millis: u64,
    flush_delay_millis: Option<u64>,
    policy: EvictionPolicyKind<K, V>,
    calculator: UnitCalculatorKind<K, V>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    store: Option<Arc<dyn CacheStore<K, V>>>,
}

impl<K, V> LocalCacheBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            high_units: i64::MAX,
            low_units: None,
            prune_level: 0.75,
            expiry_delay_millis: 0,
            flush_delay_millis: None,
            policy: EvictionPolicyKind::Hybrid,
            calculator: UnitCalculatorKind::Fixed,
            loader: None,
            store: None,
        }
    }

    /// High-water mark in units; exceeding it triggers a prune. Default
    /// is effectively unbounded.
    pub fn high_units(mut self, high_units: i64) -> Self {
        self.high_units = high_units;
        self
    }

    /// Low-water mark a prune drives the cache down to. Defaults to
    /// `prune_level` of the high mark.
    pub fn low_units(mut self, low_units: i64) -> Self {
        self.low_units = Some(low_units);
        self
    }

    /// Fraction of the high mark used as the low mark when `low_units`
    /// is not set. Must be in `[0, 0.99]`.
    pub fn prune_level(mut self, prune_level: f64) -> Self {
        self.prune_level = prune_level;
        self
    }

    /// Default time-to-live for entries inserted with [`Ttl::Default`].
    /// Zero (the default) means entries never expire.
    pub fn expiry_delay(mut self, delay: Duration) -> Self {
        self.expiry_delay_millis = delay.as_millis() as u64;
        self
    }

    /// Interval between lazy sweeps of expired entries. Zero disables the
    /// sweep. Defaults to one minute when an expiry delay is set.
    pub fn flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay_millis = Some(delay.as_millis() as u64);
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicyKind<K, V>) -> Self {
        self.policy = policy;
        self
    }

    pub fn unit_calculator(mut self, calculator: UnitCalculatorKind<K, V>) -> Self {
        self.calculator = calculator;
        self
    }

    /// Attaches a read-through loader consulted on misses.
    pub fn loader(mut self, loader: Arc<dyn CacheLoader<K, V>>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Attaches a write-through store. The store also acts as the loader
    /// unless one was set explicitly.
    pub fn store(mut self, store: Arc<dyn CacheStore<K, V>>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<LocalCache<K, V>> {
        if self.high_units < 0 {
            return Err(CacheError::InvalidArgument(
                "high_units must be non-negative".into(),
            ));
        }
        if !(0.0..=0.99).contains(&self.prune_level) {
            return Err(CacheError::InvalidArgument(
                "prune_level must be within [0, 0.99]".into(),
            ));
        }
        let low_units = match self.low_units {
            Some(low) => {
                if low < 0 || low > self.high_units {
                    return Err(CacheError::InvalidArgument(
                        "low_units must be within [0, high_units]".into(),
                    ));
                }
                low
            }
            None => (self.high_units as f64 * self.prune_level) as i64,
        };
        let flush_delay_millis = self.flush_delay_millis.unwrap_or({
            if self.expiry_delay_millis > 0 {
                DEFAULT_FLUSH_MILLIS
            } else {
                0
            }
        });

        // The store doubles as the loader unless one was set explicitly.
        let loader = self.loader.or_else(|| {
            self.store
                .as_ref()
                .map(|store| Arc::new(StoreAsLoader(Arc::clone(store))) as Arc<dyn CacheLoader<K, V>>)
        });

        let stats = Arc::new(CacheStatistics::new());
        stats_registry::register(&self.name, Arc::clone(&stats));

        Ok(LocalCache {
            name: Arc::from(self.name.as_str()),
            inner: RwLock::new(CacheInner {
                map: HashMap::new(),
                units: 0,
                next_flush: next_flush_deadline(safe_time_millis(), flush_delay_millis),
                last_prune: safe_time_millis(),
                avg_touch: 0,
                indexes: IndexMap::new(),
                triggers: Vec::new(),
            }),
            stats,
            listeners: ListenerRegistry::new(),
            locks: KeyLockManager::new(),
            loader,
            store: self.store,
            calculator: self.calculator,
            policy: self.policy,
            high_units: self.high_units,
            low_units,
            expiry_delay_millis: self.expiry_delay_millis,
            flush_delay_millis,
            released: AtomicBool::new(false),
        })
    }
}

/// Adapts a store into the loader seam (`Arc` cannot upcast between the
/// two trait objects on this toolchain).
struct StoreAsLoader<K, V>(Arc<dyn CacheStore<K, V>>);

impl<K, V> CacheLoader<K, V> for StoreAsLoader<K, V> {
    fn load(&self, key: &K) -> Option<V> {
        self.0.load(key)
    }

    fn load_all(&self, keys: &[K]) -> HashMap<K, V>
    where
        K: Eq + Hash + Clone,
    {
        self.0.load_all(keys)
    }
}

fn next_flush_deadline(now: u64, flush_delay_millis: u64) -> u64 {
    if flush_delay_millis == 0 {
        u64::MAX
    } else {
        now + flush_delay_millis
    }
}

/// The cache engine: a size-bounded map with unit accounting, expiry,
/// pluggable eviction, read-through/write-through integration, secondary
/// indexes, per-key locking and listener dispatch.
///
/// One reader-writer guard protects the engine. Reads run in shared mode
/// and touch entries through atomics; anything that mutates state (including
/// expiry discovered during a read) escalates to exclusive mode. Index
/// maintenance and listener dispatch happen inside the same exclusive
/// section as the mutation, so an event is never observed before the
/// mutation is visible.
///
/// # Examples
///
/// ```
/// use cachette::LocalCache;
///
/// let cache: LocalCache<String, u32> = LocalCache::builder("scores")
///     .high_units(1000)
///     .build()
///     .unwrap();
///
/// cache.insert("alice".to_string(), 7).unwrap();
/// assert_eq!(cache.get(&"alice".to_string()), Some(7));
/// ```
pub struct LocalCache<K: Eq + Hash, V> {
    name: Arc<str>,
    inner: RwLock<CacheInner<K, V>>,
    stats: Arc<CacheStatistics>,
    listeners: ListenerRegistry<K, V>,
    locks: KeyLockManager<K>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    store: Option<Arc<dyn CacheStore<K, V>>>,
    calculator: UnitCalculatorKind<K, V>,
    policy: EvictionPolicyKind<K, V>,
    high_units: i64,
    low_units: i64,
    expiry_delay_millis: u64,
    flush_delay_millis: u64,
    released: AtomicBool,
}

impl<K, V> LocalCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(name: impl Into<String>) -> LocalCacheBuilder<K, V> {
        LocalCacheBuilder::new(name)
    }

    /// The cache name used for statistics registration and log fields.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn statistics(&self) -> &CacheStatistics {
        &self.stats
    }

    /// Units currently held by live entries.
    pub fn current_units(&self) -> i64 {
        self.inner.read().units
    }

    pub fn high_units(&self) -> i64 {
        self.high_units
    }

    pub fn low_units(&self) -> i64 {
        self.low_units
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            Err(CacheError::IllegalState(format!(
                "cache {} has been released",
                self.name
            )))
        } else {
            Ok(())
        }
    }

    // ---- reads -----------------------------------------------------------

    /// Looks up `key`, consulting the loader on a miss when one is
    /// attached. Expired entries are evicted on sight and count as misses.
    pub fn get(&self, key: &K) -> Option<V> {
        if self.released.load(Ordering::Acquire) {
            return None;
        }
        let started = Instant::now();
        let now = safe_time_millis();

        // Fast path: shared mode, touching through atomics only.
        {
            let inner = self.inner.read();
            if now <= inner.next_flush {
                match inner.map.get(key) {
                    Some(entry) if !entry.is_expired_at(now) => {
                        entry.touch(now);
                        self.notify_touched(entry);
                        let value = entry.value().clone();
                        self.stats.record_hit(elapsed_millis(started));
                        return Some(value);
                    }
                    Some(_) => {} // expired: needs exclusive mode
                    None if self.loader.is_none() => {
                        self.stats.record_miss(elapsed_millis(started));
                        return None;
                    }
                    None => {} // miss with loader: needs exclusive mode
                }
            }
        }

        // Slow path: exclusive mode, re-checking after the escalation.
        let mut inner = self.inner.write();
        self.flush_if_due(&mut inner, now);
        let mut expired = false;
        let hit = match inner.map.get(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.touch(now);
                self.notify_touched(entry);
                Some(entry.value().clone())
            }
            Some(_) => {
                expired = true;
                None
            }
            None => None,
        };
        if let Some(value) = hit {
            self.stats.record_hit(elapsed_millis(started));
            return Some(value);
        }
        if expired {
            self.expire_key(&mut inner, key, now);
        }

        // Read-through.
        if let Some(loader) = &self.loader {
            if let Some(value) = loader.load(key) {
                let mask = KeyMask::load(HashSet::from_iter([key.clone()]));
                if let Err(err) =
                    self.apply_action(&mut inner, key.clone(), PendingAction::Store(value.clone()), Ttl::Default, &mask)
                {
                    debug!(cache = %self.name, error = %err, "read-through insert rejected");
                    self.stats.record_miss(elapsed_millis(started));
                    return None;
                }
                self.stats.record_miss(elapsed_millis(started));
                return Some(value);
            }
        }
        self.stats.record_miss(elapsed_millis(started));
        None
    }

    /// Bulk [`get`](Self::get): loads all missing keys through the loader
    /// in one call when one is attached. Keys absent everywhere are left
    /// out of the result.
    pub fn get_all(&self, keys: &[K]) -> HashMap<K, V> {
        if self.released.load(Ordering::Acquire) {
            return HashMap::new();
        }
        let now = safe_time_millis();
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();

        let mut inner = self.inner.write();
        self.flush_if_due(&mut inner, now);
        for key in keys {
            let mut expired = false;
            let hit = match inner.map.get(key) {
                Some(entry) if !entry.is_expired_at(now) => {
                    entry.touch(now);
                    self.notify_touched(entry);
                    Some(entry.value().clone())
                }
                Some(_) => {
                    expired = true;
                    None
                }
                None => None,
            };
            if expired {
                self.expire_key(&mut inner, key, now);
            }
            match hit {
                Some(value) => {
                    found.insert(key.clone(), value);
                    self.stats.record_hit(0);
                }
                None => {
                    missing.push(key.clone());
                    self.stats.record_miss(0);
                }
            }
        }

        if let (Some(loader), false) = (&self.loader, missing.is_empty()) {
            let loaded = loader.load_all(&missing);
            let mask = KeyMask::load(loaded.keys().cloned().collect());
            for (key, value) in loaded {
                match self.apply_action(
                    &mut inner,
                    key.clone(),
                    PendingAction::Store(value.clone()),
                    Ttl::Default,
                    &mask,
                ) {
                    Ok(_) => {
                        found.insert(key, value);
                    }
                    Err(err) => {
                        debug!(cache = %self.name, error = %err, "bulk read-through insert rejected")
                    }
                }
            }
        }
        found
    }

    /// Returns the cached value without touching the entry, recording
    /// statistics, or consulting the loader. Expired entries read as
    /// absent but are not evicted.
    pub fn peek(&self, key: &K) -> Option<V> {
        let now = safe_time_millis();
        let inner = self.inner.read();
        match inner.map.get(key) {
            Some(entry) if !entry.is_expired_at(now) => Some(entry.value().clone()),
            _ => None,
        }
    }

    /// True when a live (non-expired) entry exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        let now = safe_time_millis();
        let inner = self.inner.read();
        matches!(inner.map.get(key), Some(entry) if !entry.is_expired_at(now))
    }

    // ---- writes ----------------------------------------------------------

    /// Inserts or updates an entry with the default time-to-live,
    /// returning the previous value.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.insert_with_ttl(key, value, Ttl::Default)
    }

    /// Inserts or updates an entry with an explicit time-to-live.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Ttl) -> Result<Option<V>> {
        self.ensure_open()?;
        let started = Instant::now();
        let now = safe_time_millis();
        let mut inner = self.inner.write();
        self.flush_if_due(&mut inner, now);
        let previous =
            self.apply_action(&mut inner, key, PendingAction::Store(value), ttl, &KeyMask::user())?;
        self.stats.record_put(elapsed_millis(started));
        Ok(previous)
    }

    /// Bulk insert with the default time-to-live.
    pub fn insert_all(&self, entries: HashMap<K, V>) -> Result<()> {
        self.ensure_open()?;
        let now = safe_time_millis();
        let mut inner = self.inner.write();
        self.flush_if_due(&mut inner, now);
        for (key, value) in entries {
            self.apply_action(
                &mut inner,
                key,
                PendingAction::Store(value),
                Ttl::Default,
                &KeyMask::user(),
            )?;
            self.stats.record_put(0);
        }
        Ok(())
    }

    /// Removes the entry for `key`, erasing it from the backing store
    /// first when one is attached. Returns the removed value.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.ensure_open()?;
        let now = safe_time_millis();
        let mut inner = self.inner.write();
        self.flush_if_due(&mut inner, now);
        let removed =
            self.apply_action(&mut inner, key.clone(), PendingAction::Remove, Ttl::Default, &KeyMask::user())?;
        if removed.is_some() {
            self.stats.record_remove();
        }
        Ok(removed)
    }

    /// Removes every entry, erasing them from the backing store first.
    /// Listeners observe one `Deleted` event per entry.
    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        if let Some(store) = &self.store {
            let keys: Vec<K> = inner.map.keys().cloned().collect();
            store.erase_all(&keys)?;
        }

        let keys: Vec<K> = inner.map.keys().cloned().collect();
        for key in keys {
            if let Some(entry) = inner.map.remove(&key) {
                self.account_removal(&mut inner, &entry);
                self.index_delete(&mut inner, &key, Some(entry.value()));
                self.dispatch_event(
                    EventKind::Deleted,
                    key,
                    Some(entry.value().clone()),
                    None,
                    &KeyMask::user(),
                );
            }
        }

        if inner.units != 0 {
            warn!(
                cache = %self.name,
                units = inner.units,
                "unit accounting out of balance after clear; resetting to zero"
            );
            inner.units = 0;
        }
        Ok(())
    }

    /// Removes every entry without notifying listeners and without
    /// touching the backing store.
    pub fn truncate(&self) -> Result<()> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        inner.map.clear();
        inner.units = 0;
        for index in inner.indexes.values_mut() {
            index.clear();
        }
        Ok(())
    }

    /// Synthetically evicts one entry (no store erase). Listeners see a
    /// synthetic `Deleted` event.
    pub fn evict(&self, key: &K) -> Result<()> {
        self.ensure_open()?;
        let now = safe_time_millis();
        let mut inner = self.inner.write();
        let mask = match inner.map.get(key) {
            Some(entry) if entry.is_expired_at(now) => Some(KeyMask::expiry()),
            Some(_) => Some(KeyMask::synthetic()),
            None => None,
        };
        if let Some(mask) = mask {
            self.apply_remove(&mut inner, key, &mask)?;
        }
        Ok(())
    }

    /// Evicts every expired entry right now and reschedules the next
    /// flush deadline.
    pub fn evict_expired(&self) -> Result<()> {
        self.ensure_open()?;
        let now = safe_time_millis();
        let mut inner = self.inner.write();
        self.sweep_expired(&mut inner, now);
        inner.next_flush = next_flush_deadline(now, self.flush_delay_millis);
        Ok(())
    }

    // ---- invocations and queries ----------------------------------------

    /// Runs `processor` against the entry for `key` under the exclusive
    /// guard, materializing a detached entry when the key is absent, and
    /// applies whatever the processor did through the normal mutation
    /// paths.
    pub fn invoke<P: EntryProcessor<K, V>>(&self, key: &K, processor: &P) -> Result<P::Output> {
        self.ensure_open()?;
        let now = safe_time_millis();
        let mut inner = self.inner.write();
        self.flush_if_due(&mut inner, now);
        self.invoke_inner(&mut inner, key, processor, now)
    }

    /// Invokes `processor` against each of `keys`.
    pub fn invoke_all<P: EntryProcessor<K, V>>(
        &self,
        keys: &[K],
        processor: &P,
    ) -> Result<HashMap<K, P::Output>> {
        self.ensure_open()?;
        let now = safe_time_millis();
        let mut inner = self.inner.write();
        self.flush_if_due(&mut inner, now);
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            let output = self.invoke_inner(&mut inner, key, processor, now)?;
            results.insert(key.clone(), output);
        }
        Ok(results)
    }

    /// Invokes `processor` against every entry matching `filter`. The
    /// filter is narrowed through the indexes first when possible.
    pub fn invoke_filtered<P: EntryProcessor<K, V>>(
        &self,
        filter: &dyn Filter<K, V>,
        processor: &P,
    ) -> Result<HashMap<K, P::Output>> {
        self.ensure_open()?;
        let now = safe_time_millis();
        let mut inner = self.inner.write();
        self.flush_if_due(&mut inner, now);
        let keys = self.matching_keys(&inner, filter, now);
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            let output = self.invoke_inner(&mut inner, &key, processor, now)?;
            results.insert(key, output);
        }
        Ok(results)
    }

    fn invoke_inner<P: EntryProcessor<K, V>>(
        &self,
        inner: &mut CacheInner<K, V>,
        key: &K,
        processor: &P,
        now: u64,
    ) -> Result<P::Output> {
        let current = match inner.map.get(key) {
            Some(entry) if !entry.is_expired_at(now) => Some(entry.value().clone()),
            _ => None,
        };
        let mut entry = InvocableEntry::new(key, current);
        let output = processor.process(&mut entry);
        match entry.outcome() {
            InvocationOutcome::Untouched => {}
            InvocationOutcome::Stored(value) => {
                self.apply_action(
                    inner,
                    key.clone(),
                    PendingAction::Store(value),
                    Ttl::Default,
                    &KeyMask::user(),
                )?;
            }
            InvocationOutcome::Removed => {
                self.apply_action(inner, key.clone(), PendingAction::Remove, Ttl::Default, &KeyMask::user())?;
            }
        }
        Ok(output)
    }

    /// Folds the entries selected by `keys` through `aggregator` under
    /// the shared guard.
    pub fn aggregate<A: Aggregator<K, V>>(&self, keys: &[K], aggregator: &A) -> Result<A::Output> {
        self.ensure_open()?;
        let now = safe_time_millis();
        let inner = self.inner.read();
        let mut entries = keys.iter().filter_map(|key| {
            inner
                .map
                .get(key)
                .filter(|entry| !entry.is_expired_at(now))
                .map(|entry| (key, entry.value()))
        });
        Ok(aggregator.aggregate(&mut entries))
    }

    /// Folds the entries matching `filter` through `aggregator`.
    pub fn aggregate_filtered<A: Aggregator<K, V>>(
        &self,
        filter: &dyn Filter<K, V>,
        aggregator: &A,
    ) -> Result<A::Output> {
        self.ensure_open()?;
        let now = safe_time_millis();
        let inner = self.inner.read();
        let keys = self.matching_keys(&inner, filter, now);
        let mut entries = keys.iter().filter_map(|key| {
            inner
                .map
                .get(key)
                .filter(|entry| !entry.is_expired_at(now))
                .map(|entry| (key, entry.value()))
        });
        Ok(aggregator.aggregate(&mut entries))
    }

    /// Keys of the entries matching `filter`, index-narrowed when the
    /// filter supports it.
    pub fn get_keys(&self, filter: &dyn Filter<K, V>) -> Vec<K> {
        let now = safe_time_millis();
        let inner = self.inner.read();
        self.matching_keys(&inner, filter, now)
    }

    /// Values of the entries matching `filter`, unordered.
    pub fn get_values(&self, filter: &dyn Filter<K, V>) -> Vec<V> {
        self.get_entries(filter)
            .into_iter()
            .map(|(_, value)| value)
            .collect()
    }

    /// Values of the entries matching `filter`, sorted with `compare`.
    pub fn get_values_sorted(
        &self,
        filter: &dyn Filter<K, V>,
        compare: impl Fn(&V, &V) -> std::cmp::Ordering,
    ) -> Vec<V> {
        let mut values = self.get_values(filter);
        values.sort_by(compare);
        values
    }

    /// Key/value snapshots of the entries matching `filter`, unordered.
    pub fn get_entries(&self, filter: &dyn Filter<K, V>) -> Vec<(K, V)> {
        let now = safe_time_millis();
        let inner = self.inner.read();
        self.matching_keys(&inner, filter, now)
            .into_iter()
            .filter_map(|key| {
                inner
                    .map
                    .get(&key)
                    .filter(|entry| !entry.is_expired_at(now))
                    .map(|entry| (key.clone(), entry.value().clone()))
            })
            .collect()
    }

    /// Key/value snapshots matching `filter`, sorted by value with
    /// `compare`.
    pub fn get_entries_sorted(
        &self,
        filter: &dyn Filter<K, V>,
        compare: impl Fn(&V, &V) -> std::cmp::Ordering,
    ) -> Vec<(K, V)> {
        let mut entries = self.get_entries(filter);
        entries.sort_by(|a, b| compare(&a.1, &b.1));
        entries
    }

    fn matching_keys(&self, inner: &CacheInner<K, V>, filter: &dyn Filter<K, V>, now: u64) -> Vec<K> {
        match filter.apply_index(&inner.indexes) {
            Some(keys) => keys
                .into_iter()
                .filter(|key| {
                    matches!(inner.map.get(key), Some(entry) if !entry.is_expired_at(now))
                })
                .collect(),
            None => inner
                .map
                .iter()
                .filter(|(_, entry)| !entry.is_expired_at(now))
                .filter(|(key, entry)| filter.evaluate(key, entry.value()))
                .map(|(key, _)| key.clone())
                .collect(),
        }
    }

    // ---- indexes ---------------------------------------------------------

    /// Builds an index over `extractor` and registers it under the
    /// extractor's name, populating it from the current contents.
    pub fn add_index<X>(&self, extractor: X, ordered: bool) -> Result<()>
    where
        X: ValueExtractor<K, V> + 'static,
    {
        self.ensure_open()?;
        let name = extractor.name().to_string();
        let mut index = SimpleCacheIndex::new(extractor, ordered);
        let mut inner = self.inner.write();
        for (key, entry) in &inner.map {
            CacheIndex::insert(&mut index, key, entry.value());
        }
        inner.indexes.insert(name, Box::new(index));
        Ok(())
    }

    /// Drops the index registered under `extractor_name`.
    pub fn remove_index(&self, extractor_name: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.write().indexes.remove(extractor_name);
        Ok(())
    }

    // ---- triggers, listeners, locks --------------------------------------

    /// Registers a trigger vetting every mutation.
    pub fn add_trigger(&self, trigger: Arc<dyn CacheTrigger<K, V>>) {
        self.inner.write().triggers.push(trigger);
    }

    pub fn remove_trigger(&self, trigger: &Arc<dyn CacheTrigger<K, V>>) {
        self.inner
            .write()
            .triggers
            .retain(|t| !Arc::ptr_eq(t, trigger));
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheListener<K, V>>, lite: bool, synchronous: bool) {
        self.listeners.add_listener(listener, lite, synchronous);
    }

    pub fn add_listener_with_transformer(
        &self,
        listener: Arc<dyn CacheListener<K, V>>,
        lite: bool,
        synchronous: bool,
        transformer: Option<Arc<dyn EventTransformer<K, V>>>,
    ) {
        self.listeners
            .add_listener_with_transformer(listener, lite, synchronous, transformer);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn CacheListener<K, V>>) {
        self.listeners.remove_listener(listener);
    }

    pub fn add_key_listener(
        &self,
        key: K,
        listener: Arc<dyn CacheListener<K, V>>,
        lite: bool,
        synchronous: bool,
    ) {
        self.listeners.add_key_listener(key, listener, lite, synchronous);
    }

    pub fn remove_key_listener(&self, key: &K, listener: &Arc<dyn CacheListener<K, V>>) {
        self.listeners.remove_key_listener(key, listener);
    }

    pub fn add_filter_listener(
        &self,
        filter: Arc<dyn Filter<K, V>>,
        listener: Arc<dyn CacheListener<K, V>>,
        lite: bool,
        synchronous: bool,
    ) {
        self.listeners
            .add_filter_listener(filter, listener, lite, synchronous);
    }

    pub fn remove_filter_listener(&self, listener: &Arc<dyn CacheListener<K, V>>) {
        self.listeners.remove_filter_listener(listener);
    }

    /// Acquires the user-level lock for `key`; see
    /// [`KeyLockManager::lock`](crate::KeyLockManager::lock).
    pub fn lock(&self, key: &K, wait_millis: i64) -> Result<bool> {
        self.ensure_open()?;
        self.locks.lock(key, wait_millis)
    }

    pub fn unlock(&self, key: &K) -> bool {
        self.locks.unlock(key)
    }

    /// Acquires the whole-cache user-level lock.
    pub fn lock_all(&self, wait_millis: i64) -> bool {
        self.locks.lock_all(wait_millis)
    }

    pub fn unlock_all(&self) -> bool {
        self.locks.unlock_all()
    }

    // ---- loading ---------------------------------------------------------

    /// Primes the cache from the loader for one key. A no-op without a
    /// loader or when the store has no entry.
    pub fn load(&self, key: &K) -> Result<()> {
        self.ensure_open()?;
        let Some(loader) = &self.loader else {
            return Ok(());
        };
        if let Some(value) = loader.load(key) {
            let now = safe_time_millis();
            let mut inner = self.inner.write();
            self.flush_if_due(&mut inner, now);
            let mask = KeyMask::load(HashSet::from_iter([key.clone()]));
            self.apply_action(&mut inner, key.clone(), PendingAction::Store(value), Ttl::Default, &mask)?;
        }
        Ok(())
    }

    /// Primes the cache from the loader for many keys in one bulk load.
    pub fn load_all(&self, keys: &[K]) -> Result<()> {
        self.ensure_open()?;
        let Some(loader) = &self.loader else {
            return Ok(());
        };
        let loaded = loader.load_all(keys);
        if loaded.is_empty() {
            return Ok(());
        }
        let now = safe_time_millis();
        let mut inner = self.inner.write();
        self.flush_if_due(&mut inner, now);
        let mask = KeyMask::load(loaded.keys().cloned().collect());
        for (key, value) in loaded {
            self.apply_action(&mut inner, key, PendingAction::Store(value), Ttl::Default, &mask)?;
        }
        Ok(())
    }

    /// Releases the cache: drops contents, listeners, and the statistics
    /// registration. Further mutating operations fail with `IllegalState`.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.inner.write();
        inner.map.clear();
        inner.units = 0;
        inner.indexes.clear();
        inner.triggers.clear();
        drop(inner);
        self.listeners.clear();
        stats_registry::unregister(&self.name);
    }

    // ---- internals -------------------------------------------------------

    /// Applies one vetted mutation: runs triggers, mutates the map and
    /// unit accounting, maintains indexes, writes through, dispatches the
    /// event, and prunes when the high mark is breached.
    fn apply_action(
        &self,
        inner: &mut CacheInner<K, V>,
        key: K,
        action: PendingAction<V>,
        ttl: Ttl,
        mask: &KeyMask<K>,
    ) -> Result<Option<V>> {
        let now = safe_time_millis();

        // An expired entry occupying the slot dies first, with its own
        // synthetic expired event, so the mutation below sees a clean slot.
        let stale = matches!(inner.map.get(&key), Some(entry) if entry.is_expired_at(now));
        if stale {
            self.expire_key(inner, &key, now);
        }
        let old_value = inner.map.get(&key).map(|entry| entry.value().clone());

        // Triggers vet (and may rewrite) the pending change first.
        let action = if inner.triggers.is_empty() {
            action
        } else {
            let triggers: Vec<Arc<dyn CacheTrigger<K, V>>> = inner.triggers.clone();
            let mut pending = action;
            for trigger in triggers {
                let mut entry = TriggerEntry::new(&key, old_value.as_ref(), pending);
                trigger.process(&mut entry)?;
                pending = entry.into_action();
            }
            pending
        };

        match action {
            PendingAction::Store(value) => {
                self.apply_store(inner, key, value, old_value, ttl, mask, now)
            }
            PendingAction::Remove => self.apply_remove(inner, &key, mask),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_store(
        &self,
        inner: &mut CacheInner<K, V>,
        key: K,
        value: V,
        old_value: Option<V>,
        ttl: Ttl,
        mask: &KeyMask<K>,
        now: u64,
    ) -> Result<Option<V>> {
        let expiry = self.expiry_for(ttl, now);
        let units = self.calculator.units_for(&key, &value);

        let delta;
        let kind = match inner.map.entry(key.clone()) {
            Slot::Occupied(mut slot) => {
                let entry = slot.get_mut();
                let old_units = if entry.is_discarded() { 0 } else { entry.units() };
                entry.replace_value(value.clone());
                entry.set_units(units);
                entry.set_expiry_millis(expiry);
                entry.touch(now);
                delta = units - old_units;
                EventKind::Updated
            }
            Slot::Vacant(slot) => {
                slot.insert(Entry::new(key.clone(), value.clone(), now, expiry, units));
                delta = units;
                EventKind::Inserted
            }
        };
        inner.units += delta;
        if let Some(entry) = inner.map.get(&key) {
            self.notify_touched(entry);
        }

        match (kind, &old_value) {
            (EventKind::Updated, Some(old)) => self.index_update(inner, &key, Some(old), &value),
            _ => self.index_insert(inner, &key, &value),
        }

        if let Some(store) = &self.store {
            if !mask.ignores(&key) {
                store.store(&key, &value)?;
            }
        }

        self.dispatch_event(kind, key, old_value.clone(), Some(value), mask);

        if inner.units > self.high_units {
            self.prune(inner);
        }
        Ok(old_value)
    }

    fn apply_remove(
        &self,
        inner: &mut CacheInner<K, V>,
        key: &K,
        mask: &KeyMask<K>,
    ) -> Result<Option<V>> {
        if !inner.map.contains_key(key) {
            return Ok(None);
        }

        // User-initiated removal erases through before the internal
        // removal; synthetic removals (eviction, expiry) never touch the
        // store.
        if let Some(store) = &self.store {
            if !mask.synthetic && !mask.ignores(key) {
                store.erase(key)?;
            }
        }

        let entry = match inner.map.remove(key) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.account_removal(inner, &entry);
        self.index_delete(inner, key, Some(entry.value()));
        let old_value = entry.value().clone();
        self.dispatch_event(
            EventKind::Deleted,
            key.clone(),
            Some(old_value.clone()),
            None,
            mask,
        );
        Ok(Some(old_value))
    }

    fn account_removal(&self, inner: &mut CacheInner<K, V>, entry: &Entry<K, V>) {
        if !entry.is_discarded() {
            inner.units -= entry.units();
        }
        if inner.units < 0 {
            warn!(
                cache = %self.name,
                units = inner.units,
                "unit accounting went negative; resetting to zero"
            );
            inner.units = 0;
        }
    }

    fn expiry_for(&self, ttl: Ttl, now: u64) -> u64 {
        match ttl {
            Ttl::Never => 0,
            Ttl::Default => {
                if self.expiry_delay_millis == 0 {
                    0
                } else {
                    now + self.expiry_delay_millis
                }
            }
            Ttl::Of(duration) => now + duration.as_millis() as u64,
        }
    }

    fn index_insert(&self, inner: &mut CacheInner<K, V>, key: &K, value: &V) {
        for index in inner.indexes.values_mut() {
            index.insert(key, value);
        }
    }

    fn index_update(&self, inner: &mut CacheInner<K, V>, key: &K, old: Option<&V>, new: &V) {
        for index in inner.indexes.values_mut() {
            index.update(key, old, new);
        }
    }

    fn index_delete(&self, inner: &mut CacheInner<K, V>, key: &K, value: Option<&V>) {
        for index in inner.indexes.values_mut() {
            index.delete(key, value);
        }
    }

    fn dispatch_event(
        &self,
        kind: EventKind,
        key: K,
        old_value: Option<V>,
        new_value: Option<V>,
        mask: &KeyMask<K>,
    ) {
        if self.listeners.is_empty() {
            return;
        }
        self.listeners.dispatch(&CacheEvent {
            cache: Arc::clone(&self.name),
            kind,
            key,
            old_value,
            new_value,
            synthetic: mask.synthetic,
            expired: mask.expired,
        });
    }

    fn notify_touched(&self, entry: &Entry<K, V>) {
        if let EvictionPolicyKind::External(policy) = &self.policy {
            policy.entry_touched(entry);
        }
    }

    /// Removes one expired entry, announcing a synthetic expired delete.
    fn expire_key(&self, inner: &mut CacheInner<K, V>, key: &K, _now: u64) {
        let _ = self.apply_remove(inner, key, &KeyMask::expiry());
    }

    fn sweep_expired(&self, inner: &mut CacheInner<K, V>, now: u64) {
        let expired: Vec<K> = inner
            .map
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.expire_key(inner, &key, now);
        }
    }

    fn flush_if_due(&self, inner: &mut CacheInner<K, V>, now: u64) {
        if now > inner.next_flush {
            self.sweep_expired(inner, now);
            inner.next_flush = next_flush_deadline(now, self.flush_delay_millis);
        }
    }

    /// Brings the unit total from above the high mark down to the low
    /// mark: expired entries first, then the configured policy.
    fn prune(&self, inner: &mut CacheInner<K, V>) {
        let started = Instant::now();
        let now = safe_time_millis();

        self.sweep_expired(inner, now);
        if inner.units <= self.high_units {
            self.finish_prune(inner, now, started);
            return;
        }

        // avgTouch feeds the hybrid frequency score and decays with the
        // prune count so early hot streaks do not dominate forever.
        let size = inner.map.len() as u64;
        inner.avg_touch = (self.stats.total_gets() + self.stats.total_puts())
            / ((size + 1) * (self.stats.prune_count() + 1));

        match &self.policy {
            EvictionPolicyKind::External(policy) => {
                let policy = Arc::clone(policy);
                for attempt in 0..2 {
                    {
                        let mut view = InnerEvictionView {
                            cache: self,
                            inner: &mut *inner,
                        };
                        policy.request_eviction(&mut view, self.low_units);
                    }
                    if inner.units <= self.high_units {
                        break;
                    }
                    if attempt == 1 {
                        warn!(
                            cache = %self.name,
                            units = inner.units,
                            high_units = self.high_units,
                            "external eviction policy left the cache above its high mark"
                        );
                    }
                }
            }
            policy => {
                let candidates: Vec<EvictionCandidate<K>> = inner
                    .map
                    .values()
                    .map(|entry| EvictionCandidate {
                        key: entry.key().clone(),
                        units: entry.units(),
                        last_touch: entry.last_touch_millis(),
                        touch_count: entry.touch_count(),
                    })
                    .collect();
                let doomed = match policy {
                    EvictionPolicyKind::Hybrid => select_hybrid(
                        &candidates,
                        inner.units,
                        self.low_units,
                        now,
                        inner.last_prune,
                        inner.avg_touch,
                    ),
                    EvictionPolicyKind::Lru => select_lru(&candidates, inner.units, self.low_units),
                    EvictionPolicyKind::Lfu => select_lfu(&candidates, inner.units, self.low_units),
                    EvictionPolicyKind::External(_) => unreachable!(),
                };
                for key in doomed {
                    let _ = self.apply_remove(inner, &key, &KeyMask::synthetic());
                }
            }
        }

        // Decay the survivors' touch counts.
        for entry in inner.map.values() {
            entry.decay_touches();
        }
        self.finish_prune(inner, now, started);
    }

    fn finish_prune(&self, inner: &mut CacheInner<K, V>, now: u64, started: Instant) {
        inner.last_prune = now;
        self.stats.record_prune(now, elapsed_millis(started));
    }
}

/// Eviction surface handed to an external policy during a prune.
struct InnerEvictionView<'a, K: Eq + Hash, V> {
    cache: &'a LocalCache<K, V>,
    inner: &'a mut CacheInner<K, V>,
}

impl<K, V> EvictionContext<K, V> for InnerEvictionView<'_, K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn current_units(&self) -> i64 {
        self.inner.units
    }

    fn for_each_entry(&self, visit: &mut dyn FnMut(&Entry<K, V>)) {
        for entry in self.inner.map.values() {
            visit(entry);
        }
    }

    fn evict(&mut self, key: &K) -> bool {
        match self
            .cache
            .apply_remove(self.inner, key, &KeyMask::synthetic())
        {
            Ok(removed) => removed.is_some(),
            Err(_) => false,
        }
    }
}

fn elapsed_millis(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl<K: Eq + Hash, V> Drop for LocalCache<K, V> {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            stats_registry::unregister(&self.name);
        }
    }
}
