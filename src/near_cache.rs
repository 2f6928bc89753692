use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::entry::Ttl;
use crate::error::{CacheError, Result};
use crate::filter::Filter;
use crate::listener::{CacheEvent, CacheListener};
use crate::local_cache::LocalCache;
use crate::processor::{Aggregator, DynAggregator, DynEntryProcessor, EntryProcessor};

/// How many front-resident key listeners an `Auto` near cache tolerates
/// before promoting itself to the `All` strategy.
const AUTO_PROMOTION_THRESHOLD: usize = 1024;

/// Governs what the front tier caches and how back-tier invalidations
/// reach it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidationStrategy {
    /// The front never receives invalidations; callers accept the risk of
    /// stale data, typically bounding it with a front TTL.
    None,
    /// The back pushes invalidations only for keys the front currently
    /// holds; a key listener is registered on cache-in and deregistered on
    /// cache-out.
    Present,
    /// The back pushes invalidations for every key it mutates.
    All,
    /// Starts as `Present` and switches to `All` once the resident
    /// listener set grows past an internal threshold.
    Auto,
}

/// Currently active invalidation mode (the strategy resolves `Auto` into
/// one of these at runtime).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    None = 0,
    Present = 1,
    All = 2,
}

impl Mode {
    fn from_u8(raw: u8) -> Mode {
        match raw {
            1 => Mode::Present,
            2 => Mode::All,
            _ => Mode::None,
        }
    }
}

/// Receives membership events from the back tier's service.
pub trait MemberListener: Send + Sync {
    fn member_joined(&self) {}
    fn member_left(&self) {}
}

/// The remote back tier a [`NearCache`] composes over.
///
/// This is the seam the wire transport implements; the engine only ever
/// talks to it through this trait. Invocations and aggregations travel in
/// type-erased form (`Box<dyn Any>`) because the trait must stay object
/// safe.
pub trait RemoteCache<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;
    fn get_all(&self, keys: &[K]) -> HashMap<K, V>;
    fn insert(&self, key: K, value: V) -> Result<Option<V>>;
    fn insert_with_ttl(&self, key: K, value: V, ttl: Ttl) -> Result<Option<V>>;
    fn insert_all(&self, entries: HashMap<K, V>) -> Result<()>;
    fn remove(&self, key: &K) -> Result<Option<V>>;
    fn clear(&self) -> Result<()>;
    fn truncate(&self) -> Result<()>;
    fn contains(&self, key: &K) -> bool;
    fn len(&self) -> usize;

    fn lock(&self, key: &K, wait_millis: i64) -> Result<bool>;
    fn unlock(&self, key: &K) -> bool;

    fn invoke_dyn(
        &self,
        key: &K,
        processor: &dyn DynEntryProcessor<K, V>,
    ) -> Result<Box<dyn Any + Send>>;
    fn aggregate_dyn(
        &self,
        keys: &[K],
        aggregator: &dyn DynAggregator<K, V>,
    ) -> Result<Box<dyn Any + Send>>;

    fn get_keys(&self, filter: &dyn Filter<K, V>) -> Vec<K>;
    fn get_entries(&self, filter: &dyn Filter<K, V>) -> Vec<(K, V)>;

    /// Registers a listener for every mutation the back observes.
    fn add_listener(&self, listener: Arc<dyn CacheListener<K, V>>, lite: bool);
    fn remove_listener(&self, listener: &Arc<dyn CacheListener<K, V>>);

    /// Registers a listener for mutations of one key.
    fn add_key_listener(&self, key: &K, listener: Arc<dyn CacheListener<K, V>>, lite: bool);
    fn remove_key_listener(&self, key: &K, listener: &Arc<dyn CacheListener<K, V>>);

    fn add_member_listener(&self, listener: Arc<dyn MemberListener>);
    fn remove_member_listener(&self, listener: &Arc<dyn MemberListener>);

    /// Detaches this client from the cache, leaving remote data intact.
    fn release(&self);

    /// Destroys the cache globally.
    fn destroy(&self) -> Result<()>;
}

/// Back-tier listener that drops invalidated keys from the front.
struct FrontInvalidator<K: Eq + Hash + Clone + Send + Sync + 'static, V: Clone + Send + Sync + 'static> {
    front: Arc<LocalCache<K, V>>,
}

impl<K, V> CacheListener<K, V> for FrontInvalidator<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn entry_inserted(&self, event: &CacheEvent<K, V>) {
        let _ = self.front.evict(&event.key);
    }

    fn entry_updated(&self, event: &CacheEvent<K, V>) {
        let _ = self.front.evict(&event.key);
    }

    fn entry_deleted(&self, event: &CacheEvent<K, V>) {
        let _ = self.front.evict(&event.key);
    }
}

/// Front-tier listener that deregisters the back-tier key listener when a
/// key leaves the front (eviction, expiry, or explicit removal).
struct FrontWatcher<K: Eq + Hash + Clone + Send + Sync + 'static, V: Clone + Send + Sync + 'static> {
    back: Arc<dyn RemoteCache<K, V>>,
    invalidator: Arc<dyn CacheListener<K, V>>,
    present: Arc<Mutex<HashSet<K>>>,
    mode: Arc<AtomicU8>,
}

impl<K, V> CacheListener<K, V> for FrontWatcher<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn entry_deleted(&self, event: &CacheEvent<K, V>) {
        if Mode::from_u8(self.mode.load(Ordering::Acquire)) != Mode::Present {
            return;
        }
        if self.present.lock().remove(&event.key) {
            self.back.remove_key_listener(&event.key, &self.invalidator);
        }
    }
}

/// Two-tier cache: a local front backed by a remote cache, linked by an
/// invalidation strategy.
///
/// Reads check the front and fall back to the back, populating the front
/// on the way out. Writes, removes, locks, invocations, aggregations, and
/// queries go to the back directly; the front learns about them through
/// the invalidation listeners (or not at all under
/// [`InvalidationStrategy::None`]).
pub struct NearCache<K: Eq + Hash + Clone + Send + Sync + 'static, V: Clone + Send + Sync + 'static> {
    front: Arc<LocalCache<K, V>>,
    back: Arc<dyn RemoteCache<K, V>>,
    strategy: InvalidationStrategy,
    mode: Arc<AtomicU8>,
    invalidator: Arc<dyn CacheListener<K, V>>,
    watcher: Arc<dyn CacheListener<K, V>>,
    member_listener: Arc<dyn MemberListener>,
    present: Arc<Mutex<HashSet<K>>>,
    released: AtomicBool,
}

struct ServiceWatcher<K: Eq + Hash + Clone + Send + Sync + 'static, V: Clone + Send + Sync + 'static> {
    front: Arc<LocalCache<K, V>>,
    present: Arc<Mutex<HashSet<K>>>,
    back: Mutex<Option<Arc<dyn RemoteCache<K, V>>>>,
    invalidator: Mutex<Option<Arc<dyn CacheListener<K, V>>>>,
    reset_on_left: bool,
}

impl<K, V> ServiceWatcher<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn reset_front(&self) {
        let keys: Vec<K> = {
            let mut present = self.present.lock();
            present.drain().collect()
        };
        if !keys.is_empty() {
            let back = self.back.lock().clone();
            let invalidator = self.invalidator.lock().clone();
            if let (Some(back), Some(invalidator)) = (back, invalidator) {
                for key in &keys {
                    back.remove_key_listener(key, &invalidator);
                }
            }
        }
        let _ = self.front.truncate();
        debug!(cache = self.front.name(), "near-cache front reset");
    }
}

impl<K, V> MemberListener for ServiceWatcher<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn member_joined(&self) {
        self.reset_front();
    }

    fn member_left(&self) {
        if self.reset_on_left {
            self.reset_front();
        }
    }
}

impl<K, V> NearCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Composes `front` over `back` with the given invalidation strategy.
    ///
    /// Under `All` the global invalidation listener is registered
    /// immediately; under `Present`/`Auto` key listeners come and go with
    /// front residency.
    pub fn new(
        front: LocalCache<K, V>,
        back: Arc<dyn RemoteCache<K, V>>,
        strategy: InvalidationStrategy,
    ) -> Self {
        let front = Arc::new(front);
        let present = Arc::new(Mutex::new(HashSet::new()));
        let mode = Arc::new(AtomicU8::new(match strategy {
            InvalidationStrategy::None => Mode::None as u8,
            InvalidationStrategy::Present | InvalidationStrategy::Auto => Mode::Present as u8,
            InvalidationStrategy::All => Mode::All as u8,
        }));

        let invalidator: Arc<dyn CacheListener<K, V>> = Arc::new(FrontInvalidator {
            front: Arc::clone(&front),
        });
        if Mode::from_u8(mode.load(Ordering::Acquire)) == Mode::All {
            back.add_listener(Arc::clone(&invalidator), true);
        }

        let watcher: Arc<dyn CacheListener<K, V>> = Arc::new(FrontWatcher {
            back: Arc::clone(&back),
            invalidator: Arc::clone(&invalidator),
            present: Arc::clone(&present),
            mode: Arc::clone(&mode),
        });
        front.add_listener(Arc::clone(&watcher), true, true);

        let service_watcher = Arc::new(ServiceWatcher {
            front: Arc::clone(&front),
            present: Arc::clone(&present),
            back: Mutex::new(Some(Arc::clone(&back))),
            invalidator: Mutex::new(Some(Arc::clone(&invalidator))),
            reset_on_left: strategy != InvalidationStrategy::None,
        });
        let member_listener: Arc<dyn MemberListener> = service_watcher;
        back.add_member_listener(Arc::clone(&member_listener));

        Self {
            front,
            back,
            strategy,
            mode,
            invalidator,
            watcher,
            member_listener,
            present,
            released: AtomicBool::new(false),
        }
    }

    /// The local front tier.
    pub fn front(&self) -> &LocalCache<K, V> {
        &self.front
    }

    /// The remote back tier.
    pub fn back(&self) -> &Arc<dyn RemoteCache<K, V>> {
        &self.back
    }

    pub fn strategy(&self) -> InvalidationStrategy {
        self.strategy
    }

    fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            Err(CacheError::IllegalState("near cache has been released".into()))
        } else {
            Ok(())
        }
    }

    /// Reads through the tiers: front hit, else back, populating the
    /// front (and registering an invalidation listener under `Present`).
    pub fn get(&self, key: &K) -> Option<V> {
        if self.released.load(Ordering::Acquire) {
            return None;
        }
        if let Some(value) = self.front.get(key) {
            return Some(value);
        }

        let registered = self.register_presence(key);
        match self.back.get(key) {
            Some(value) => {
                if self.front.insert(key.clone(), value.clone()).is_err() {
                    self.forget_presence(key, registered);
                }
                Some(value)
            }
            None => {
                self.forget_presence(key, registered);
                None
            }
        }
    }

    /// Bulk read: front hits first, then one bulk back read for the rest.
    pub fn get_all(&self, keys: &[K]) -> HashMap<K, V> {
        if self.released.load(Ordering::Acquire) {
            return HashMap::new();
        }
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in keys {
            match self.front.get(key) {
                Some(value) => {
                    found.insert(key.clone(), value);
                }
                None => missing.push(key.clone()),
            }
        }
        if missing.is_empty() {
            return found;
        }

        let registered: Vec<(K, bool)> = missing
            .iter()
            .map(|key| (key.clone(), self.register_presence(key)))
            .collect();
        let loaded = self.back.get_all(&missing);
        for (key, was_registered) in registered {
            match loaded.get(&key) {
                Some(value) => {
                    if self.front.insert(key.clone(), value.clone()).is_err() {
                        self.forget_presence(&key, was_registered);
                    }
                    found.insert(key, value.clone());
                }
                None => self.forget_presence(&key, was_registered),
            }
        }
        found
    }

    /// Registers presence interest in `key` before the back read, so an
    /// invalidation cannot slip between the read and the listener.
    /// Returns true when a listener was registered by this call.
    fn register_presence(&self, key: &K) -> bool {
        if self.mode() != Mode::Present {
            return false;
        }
        let newly = self.present.lock().insert(key.clone());
        if newly {
            self.back
                .add_key_listener(key, Arc::clone(&self.invalidator), true);
            self.maybe_promote();
        }
        newly
    }

    fn forget_presence(&self, key: &K, registered: bool) {
        if registered && self.present.lock().remove(key) {
            self.back.remove_key_listener(key, &self.invalidator);
        }
    }

    /// Auto strategy: switch to `All` once the resident listener set has
    /// grown past the threshold.
    fn maybe_promote(&self) {
        if self.strategy != InvalidationStrategy::Auto {
            return;
        }
        let over = { self.present.lock().len() > AUTO_PROMOTION_THRESHOLD };
        if !over {
            return;
        }
        if self
            .mode
            .compare_exchange(
                Mode::Present as u8,
                Mode::All as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            debug!(cache = self.front.name(), "auto strategy promoted to All");
            self.back.add_listener(Arc::clone(&self.invalidator), true);
            let keys: Vec<K> = self.present.lock().drain().collect();
            for key in keys {
                self.back.remove_key_listener(&key, &self.invalidator);
            }
        }
    }

    /// Writes go to the back; the front copy is invalidated rather than
    /// updated in place.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.ensure_open()?;
        self.front.evict(&key)?;
        self.back.insert(key, value)
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Ttl) -> Result<Option<V>> {
        self.ensure_open()?;
        self.front.evict(&key)?;
        self.back.insert_with_ttl(key, value, ttl)
    }

    pub fn insert_all(&self, entries: HashMap<K, V>) -> Result<()> {
        self.ensure_open()?;
        for key in entries.keys() {
            self.front.evict(key)?;
        }
        self.back.insert_all(entries)
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.ensure_open()?;
        self.front.evict(key)?;
        self.back.remove(key)
    }

    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.reset_front();
        self.back.clear()
    }

    pub fn truncate(&self) -> Result<()> {
        self.ensure_open()?;
        self.reset_front();
        self.back.truncate()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.front.contains(key) || self.back.contains(key)
    }

    /// Size of the back tier (the authoritative data set).
    pub fn len(&self) -> usize {
        self.back.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks on the back tier. The front copy of the key is dropped on
    /// success so the holder observes authoritative data.
    pub fn lock(&self, key: &K, wait_millis: i64) -> Result<bool> {
        self.ensure_open()?;
        let locked = self.back.lock(key, wait_millis)?;
        if locked {
            self.front.evict(key)?;
        }
        Ok(locked)
    }

    pub fn unlock(&self, key: &K) -> bool {
        self.back.unlock(key)
    }

    /// Invokes a processor on the back tier, downcasting the erased
    /// result back to the processor's typed output.
    pub fn invoke<P>(&self, key: &K, processor: &P) -> Result<P::Output>
    where
        P: EntryProcessor<K, V>,
        P::Output: Send + 'static,
    {
        self.ensure_open()?;
        self.front.evict(key)?;
        let erased = self.back.invoke_dyn(key, processor)?;
        erased
            .downcast::<P::Output>()
            .map(|output| *output)
            .map_err(|_| CacheError::Fatal("invocation result had an unexpected type".into()))
    }

    /// Aggregates over the back tier, downcasting the erased result.
    pub fn aggregate<A>(&self, keys: &[K], aggregator: &A) -> Result<A::Output>
    where
        A: Aggregator<K, V>,
        A::Output: Send + 'static,
    {
        self.ensure_open()?;
        let erased = self.back.aggregate_dyn(keys, aggregator)?;
        erased
            .downcast::<A::Output>()
            .map(|output| *output)
            .map_err(|_| CacheError::Fatal("aggregation result had an unexpected type".into()))
    }

    /// Queries go to the back tier.
    pub fn get_keys(&self, filter: &dyn Filter<K, V>) -> Vec<K> {
        self.back.get_keys(filter)
    }

    pub fn get_entries(&self, filter: &dyn Filter<K, V>) -> Vec<(K, V)> {
        self.back.get_entries(filter)
    }

    fn reset_front(&self) {
        let keys: Vec<K> = self.present.lock().drain().collect();
        for key in keys {
            self.back.remove_key_listener(&key, &self.invalidator);
        }
        let _ = self.front.truncate();
    }

    /// Tears down the local front and detaches from back-tier events,
    /// leaving back data intact.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reset_front();
        if self.mode() == Mode::All {
            self.back.remove_listener(&self.invalidator);
        }
        self.back.remove_member_listener(&self.member_listener);
        self.front.remove_listener(&self.watcher);
        self.front.release();
    }

    /// Releases this client and orders the back cache destroyed globally.
    pub fn destroy(&self) -> Result<()> {
        self.release();
        self.back.destroy()
    }
}
