use std::collections::HashMap;
use std::hash::Hash;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::filter::Filter;

/// The kind of mutation an event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Inserted,
    Updated,
    Deleted,
}

/// A change notification emitted after a successful mutation.
///
/// Events carry owned snapshots of the key and values, so a listener can
/// hold on to them without borrowing from the cache. `synthetic` marks
/// events the engine generated itself (eviction, expiry, loader inserts);
/// `expired` additionally marks deletes triggered by expiry.
#[derive(Clone, Debug)]
pub struct CacheEvent<K, V> {
    pub cache: Arc<str>,
    pub kind: EventKind,
    pub key: K,
    pub old_value: Option<V>,
    pub new_value: Option<V>,
    pub synthetic: bool,
    pub expired: bool,
}

impl<K: Clone, V: Clone> CacheEvent<K, V> {
    /// A copy of this event with the values stripped, for lite listeners.
    pub fn to_lite(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            kind: self.kind,
            key: self.key.clone(),
            old_value: None,
            new_value: None,
            synthetic: self.synthetic,
            expired: self.expired,
        }
    }
}

/// Receives change notifications from a cache.
///
/// Synchronous listeners run on the mutating thread inside the cache's
/// exclusive section and must not call back into the same cache.
/// Asynchronous listeners are dispatched to a shared background thread in
/// emission order.
pub trait CacheListener<K, V>: Send + Sync {
    fn entry_inserted(&self, _event: &CacheEvent<K, V>) {}
    fn entry_updated(&self, _event: &CacheEvent<K, V>) {}
    fn entry_deleted(&self, _event: &CacheEvent<K, V>) {}
}

/// Rewrites or suppresses events before delivery to one listener.
///
/// Returning `None` suppresses delivery entirely.
pub trait EventTransformer<K, V>: Send + Sync {
    fn transform(&self, event: CacheEvent<K, V>) -> Option<CacheEvent<K, V>>;
}

fn deliver<K, V>(listener: &dyn CacheListener<K, V>, event: &CacheEvent<K, V>) {
    match event.kind {
        EventKind::Inserted => listener.entry_inserted(event),
        EventKind::Updated => listener.entry_updated(event),
        EventKind::Deleted => listener.entry_deleted(event),
    }
}

/// One registered listener plus its delivery options.
struct Registration<K, V> {
    listener: Arc<dyn CacheListener<K, V>>,
    lite: bool,
    synchronous: bool,
    transformer: Option<Arc<dyn EventTransformer<K, V>>>,
}

impl<K, V> Clone for Registration<K, V> {
    fn clone(&self) -> Self {
        Self {
            listener: Arc::clone(&self.listener),
            lite: self.lite,
            synchronous: self.synchronous,
            transformer: self.transformer.as_ref().map(Arc::clone),
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Shared dispatcher thread for asynchronous listeners. One thread keeps
/// delivery in emission order across all caches in the process.
static ASYNC_DISPATCHER: Lazy<Mutex<Sender<Job>>> = Lazy::new(|| {
    let (tx, rx) = mpsc::channel::<Job>();
    thread::Builder::new()
        .name("cachette-events".to_string())
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                job();
            }
        })
        .expect("failed to spawn event dispatcher thread");
    Mutex::new(tx)
});

fn enqueue_async(job: Job) {
    // A send error means the dispatcher died with the process; drop the event.
    let _ = ASYNC_DISPATCHER.lock().send(job);
}

/// Multiplexes key, filter, and global listeners for one cache.
///
/// Listener identity is `Arc` pointer identity: removing a listener
/// requires the same `Arc` that registered it.
pub struct ListenerRegistry<K, V> {
    key_listeners: RwLock<HashMap<K, Vec<Registration<K, V>>>>,
    filter_listeners: RwLock<Vec<(Arc<dyn Filter<K, V>>, Registration<K, V>)>>,
    global_listeners: RwLock<Vec<Registration<K, V>>>,
}

impl<K, V> Default for ListenerRegistry<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ListenerRegistry<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            key_listeners: RwLock::new(HashMap::new()),
            filter_listeners: RwLock::new(Vec::new()),
            global_listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registers a listener for every mutation of one key.
    pub fn add_key_listener(
        &self,
        key: K,
        listener: Arc<dyn CacheListener<K, V>>,
        lite: bool,
        synchronous: bool,
    ) {
        self.key_listeners.write().entry(key).or_default().push(Registration {
            listener,
            lite,
            synchronous,
            transformer: None,
        });
    }

    /// Removes a key listener registered with the same `Arc`.
    pub fn remove_key_listener(&self, key: &K, listener: &Arc<dyn CacheListener<K, V>>) {
        let mut map = self.key_listeners.write();
        if let Some(registrations) = map.get_mut(key) {
            registrations.retain(|r| !Arc::ptr_eq(&r.listener, listener));
            if registrations.is_empty() {
                map.remove(key);
            }
        }
    }

    /// Registers a listener for mutations whose entries match `filter`.
    ///
    /// Inserts and updates are matched against the new value, deletes
    /// against the old value.
    pub fn add_filter_listener(
        &self,
        filter: Arc<dyn Filter<K, V>>,
        listener: Arc<dyn CacheListener<K, V>>,
        lite: bool,
        synchronous: bool,
    ) {
        self.filter_listeners.write().push((
            filter,
            Registration {
                listener,
                lite,
                synchronous,
                transformer: None,
            },
        ));
    }

    /// Removes a filter listener registered with the same listener `Arc`.
    pub fn remove_filter_listener(&self, listener: &Arc<dyn CacheListener<K, V>>) {
        self.filter_listeners
            .write()
            .retain(|(_, r)| !Arc::ptr_eq(&r.listener, listener));
    }

    /// Registers a listener for every mutation of the cache.
    pub fn add_listener(
        &self,
        listener: Arc<dyn CacheListener<K, V>>,
        lite: bool,
        synchronous: bool,
    ) {
        self.add_listener_with_transformer(listener, lite, synchronous, None)
    }

    /// Registers a global listener with an optional per-listener event
    /// transformer.
    pub fn add_listener_with_transformer(
        &self,
        listener: Arc<dyn CacheListener<K, V>>,
        lite: bool,
        synchronous: bool,
        transformer: Option<Arc<dyn EventTransformer<K, V>>>,
    ) {
        self.global_listeners.write().push(Registration {
            listener,
            lite,
            synchronous,
            transformer,
        });
    }

    /// Removes a global listener registered with the same `Arc`.
    pub fn remove_listener(&self, listener: &Arc<dyn CacheListener<K, V>>) {
        self.global_listeners
            .write()
            .retain(|r| !Arc::ptr_eq(&r.listener, listener));
    }

    /// Drops every registration. Used when a cache is released.
    pub fn clear(&self) {
        self.key_listeners.write().clear();
        self.filter_listeners.write().clear();
        self.global_listeners.write().clear();
    }

    /// True when no listener is registered; lets the engine skip event
    /// construction entirely.
    pub fn is_empty(&self) -> bool {
        self.key_listeners.read().is_empty()
            && self.filter_listeners.read().is_empty()
            && self.global_listeners.read().is_empty()
    }

    /// Dispatches one event to every matching registration.
    ///
    /// Synchronous registrations run inline on the calling thread in
    /// registration order; asynchronous ones are queued to the shared
    /// dispatcher preserving per-key emission order.
    pub fn dispatch(&self, event: &CacheEvent<K, V>) {
        let mut matched: Vec<Registration<K, V>> = Vec::new();

        {
            let globals = self.global_listeners.read();
            matched.extend(globals.iter().cloned());
        }
        {
            let keyed = self.key_listeners.read();
            if let Some(registrations) = keyed.get(&event.key) {
                matched.extend(registrations.iter().cloned());
            }
        }
        {
            let filtered = self.filter_listeners.read();
            if !filtered.is_empty() {
                let subject = match event.kind {
                    EventKind::Deleted => event.old_value.as_ref(),
                    _ => event.new_value.as_ref(),
                };
                if let Some(value) = subject {
                    for (filter, registration) in filtered.iter() {
                        if filter.evaluate(&event.key, value) {
                            matched.push(registration.clone());
                        }
                    }
                }
            }
        }

        for registration in matched {
            let delivered = if registration.lite {
                event.to_lite()
            } else {
                event.clone()
            };
            let delivered = match &registration.transformer {
                Some(transformer) => match transformer.transform(delivered) {
                    Some(event) => event,
                    None => continue,
                },
                None => delivered,
            };
            if registration.synchronous {
                deliver(registration.listener.as_ref(), &delivered);
            } else {
                let listener = Arc::clone(&registration.listener);
                enqueue_async(Box::new(move || deliver(listener.as_ref(), &delivered)));
            }
        }
    }
}
