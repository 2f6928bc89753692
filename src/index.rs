use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::marker::PhantomData;

use tracing::warn;

use crate::extractor::{Extracted, ValueExtractor};
use crate::time::safe_time_millis;

/// At most this many missing-bucket warnings are logged per window before
/// suppression kicks in.
const MAX_WARNINGS_PER_WINDOW: u32 = 10;
const WARNING_WINDOW_MILLIS: u64 = 5 * 60 * 1000;

/// Registry of indexes attached to a cache, keyed by extractor name.
pub type IndexMap<K, V> = HashMap<String, Box<dyn CacheIndex<K, V>>>;

/// Object-safe view of an index so indexes over different attribute types
/// can coexist on one cache.
///
/// Maintenance calls are made inside the cache's exclusive section, which
/// is what linearizes index updates with the corresponding mutation.
pub trait CacheIndex<K, V>: Send + Sync {
    /// Indexes a newly inserted entry.
    fn insert(&mut self, key: &K, value: &V);

    /// Re-indexes an updated entry. `old` is the pre-mutation value when
    /// the caller still owns it.
    fn update(&mut self, key: &K, old: Option<&V>, new: &V);

    /// Drops all mappings for a removed entry. `value` is the removed
    /// value, used to locate mappings when no forward map is kept.
    fn delete(&mut self, key: &K, value: Option<&V>);

    /// Drops every mapping. Used when the cache is truncated.
    fn clear(&mut self);

    /// True when no forward map is maintained.
    fn is_partial(&self) -> bool;

    /// True when the index was declared ordered.
    fn is_ordered(&self) -> bool;

    /// Name of the extractor this index was built over.
    fn extractor_name(&self) -> &str;

    /// Downcast hook for index-aware filters.
    fn as_any(&self) -> &dyn Any;
}

/// Forward + inverted index over one extracted attribute.
///
/// For every non-excluded entry the forward map records the extracted
/// attribute and the inverted map records `attribute -> {keys}`. Entries
/// whose extraction failed sit in the excluded set and appear in neither
/// map. A multi-valued extraction ([`Extracted::Collection`]) maps each
/// element back to the key individually; indexing a whole collection as a
/// single attribute is done by extracting it as one [`Extracted::Value`].
///
/// Indexes over key extractors have immutable values, so their `update`
/// is a no-op.
pub struct SimpleCacheIndex<K, V, X: ValueExtractor<K, V>> {
    extractor: X,
    ordered: bool,
    partial: bool,
    immutable_values: bool,
    forward: HashMap<K, Extracted<X::Attr>>,
    inverted: HashMap<X::Attr, HashSet<K>>,
    excluded: HashSet<K>,
    warnings_window_start: u64,
    warnings_in_window: u32,
    _value: PhantomData<fn(&V)>,
}

impl<K, V, X> SimpleCacheIndex<K, V, X>
where
    K: Eq + Hash + Clone,
    X: ValueExtractor<K, V>,
{
    /// Creates an index over `extractor`. `ordered` is recorded on the
    /// descriptor and honored by queries when sorting results.
    pub fn new(extractor: X, ordered: bool) -> Self {
        let immutable_values = extractor.targets_key();
        Self {
            extractor,
            ordered,
            partial: false,
            immutable_values,
            forward: HashMap::new(),
            inverted: HashMap::new(),
            excluded: HashSet::new(),
            warnings_window_start: 0,
            warnings_in_window: 0,
            _value: PhantomData,
        }
    }

    /// Creates a partial index: no forward map is maintained and update
    /// maintenance relies on the caller supplying the original value.
    pub fn new_partial(extractor: X, ordered: bool) -> Self {
        let mut index = Self::new(extractor, ordered);
        index.partial = true;
        index
    }

    /// The extracted attribute recorded for `key`.
    ///
    /// Returns `Some(Extracted::None)` for a key whose extraction failed
    /// (the `NO_VALUE` sentinel) and `None` for a key this index has never
    /// seen.
    pub fn get(&self, key: &K) -> Option<Extracted<X::Attr>> {
        if self.excluded.contains(key) {
            return Some(Extracted::None);
        }
        self.forward.get(key).cloned()
    }

    /// The set of keys whose entries extract to `attr`.
    pub fn keys_for(&self, attr: &X::Attr) -> Option<&HashSet<K>> {
        self.inverted.get(attr)
    }

    /// Number of distinct attribute values currently indexed.
    pub fn cardinality(&self) -> usize {
        self.inverted.len()
    }

    /// Keys excluded because their extraction failed.
    pub fn excluded(&self) -> &HashSet<K> {
        &self.excluded
    }

    fn add_mappings(&mut self, key: &K, extracted: &Extracted<X::Attr>) {
        match extracted {
            Extracted::Value(attr) => {
                self.inverted
                    .entry(attr.clone())
                    .or_default()
                    .insert(key.clone());
            }
            Extracted::Collection(attrs) => {
                for attr in attrs {
                    self.inverted
                        .entry(attr.clone())
                        .or_default()
                        .insert(key.clone());
                }
            }
            Extracted::None => {}
        }
    }

    fn remove_mapping(&mut self, attr: &X::Attr, key: &K) {
        let mut should_warn = false;
        let mut should_remove_bucket = false;
        match self.inverted.get_mut(attr) {
            Some(bucket) => {
                if !bucket.remove(key) && !self.partial {
                    should_warn = true;
                }
                if bucket.is_empty() {
                    should_remove_bucket = true;
                }
            }
            None => {
                if !self.partial {
                    should_warn = true;
                }
            }
        }
        if should_remove_bucket {
            self.inverted.remove(attr);
        }
        if should_warn {
            self.warn_missing_bucket();
        }
    }

    /// A removal found no inverse mapping for a non-partial index: the
    /// forward and inverted maps disagree. Logged with suppression so a
    /// corrupted index cannot flood the log.
    fn warn_missing_bucket(&mut self) {
        let now = safe_time_millis();
        if now.saturating_sub(self.warnings_window_start) > WARNING_WINDOW_MILLIS {
            self.warnings_window_start = now;
            self.warnings_in_window = 0;
        }
        if self.warnings_in_window < MAX_WARNINGS_PER_WINDOW {
            self.warnings_in_window += 1;
            warn!(
                extractor = self.extractor.name(),
                "inverse index is missing a mapping; the index may be corrupted"
            );
        }
    }

    fn insert_inner(&mut self, key: &K, value: &V) {
        let extracted = self.extractor.extract(key, value);
        if extracted.is_none() {
            self.excluded.insert(key.clone());
            return;
        }
        self.add_mappings(key, &extracted);
        if !self.partial {
            self.forward.insert(key.clone(), extracted);
        }
    }

    fn update_inner(&mut self, key: &K, old: Option<&V>, new: &V) {
        if self.immutable_values {
            return;
        }

        let new_extracted = self.extractor.extract(key, new);
        let old_extracted = if self.partial {
            match old {
                Some(old_value) => Some(self.extractor.extract(key, old_value)),
                None if self.excluded.contains(key) => Some(Extracted::None),
                None => None,
            }
        } else if self.excluded.contains(key) {
            Some(Extracted::None)
        } else {
            self.forward.get(key).cloned()
        };

        match old_extracted {
            None => {
                // Never indexed: treat as a fresh insert.
                self.insert_inner(key, new);
                return;
            }
            Some(old_extracted) if old_extracted == new_extracted => return,
            Some(Extracted::None) => {
                // The old extraction failed, so there is no record of which
                // buckets may still hold the key. Scan every bucket, but
                // keep mappings that the new value re-establishes.
                let keep: HashSet<&X::Attr> = match &new_extracted {
                    Extracted::Value(attr) => std::iter::once(attr).collect(),
                    Extracted::Collection(attrs) => attrs.iter().collect(),
                    Extracted::None => HashSet::new(),
                };
                self.inverted.retain(|attr, bucket| {
                    if !keep.contains(attr) {
                        bucket.remove(key);
                    }
                    !bucket.is_empty()
                });
            }
            Some(Extracted::Collection(old_attrs)) => {
                let new_attrs: HashSet<&X::Attr> = match &new_extracted {
                    Extracted::Value(attr) => std::iter::once(attr).collect(),
                    Extracted::Collection(attrs) => attrs.iter().collect(),
                    Extracted::None => HashSet::new(),
                };
                for attr in old_attrs {
                    if !new_attrs.contains(&attr) {
                        self.remove_mapping(&attr, key);
                    }
                }
            }
            Some(Extracted::Value(old_attr)) => {
                self.remove_mapping(&old_attr, key);
            }
        }

        if new_extracted.is_none() {
            self.forward.remove(key);
            self.excluded.insert(key.clone());
        } else {
            self.add_mappings(key, &new_extracted);
            if !self.partial {
                self.forward.insert(key.clone(), new_extracted);
            }
            self.excluded.remove(key);
        }
    }

    fn delete_inner(&mut self, key: &K, value: Option<&V>) {
        let extracted = match self.forward.remove(key) {
            Some(extracted) => Some(extracted),
            None => value.map(|v| self.extractor.extract(key, v)),
        };
        if self.excluded.remove(key) {
            return;
        }
        match extracted {
            Some(Extracted::Value(attr)) => self.remove_mapping(&attr, key),
            Some(Extracted::Collection(attrs)) => {
                for attr in attrs {
                    self.remove_mapping(&attr, key);
                }
            }
            Some(Extracted::None) | None => {}
        }
    }
}

impl<K, V, X> CacheIndex<K, V> for SimpleCacheIndex<K, V, X>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: 'static,
    X: ValueExtractor<K, V> + 'static,
{
    fn insert(&mut self, key: &K, value: &V) {
        self.insert_inner(key, value);
    }

    fn update(&mut self, key: &K, old: Option<&V>, new: &V) {
        self.update_inner(key, old, new);
    }

    fn delete(&mut self, key: &K, value: Option<&V>) {
        self.delete_inner(key, value);
    }

    fn clear(&mut self) {
        self.forward.clear();
        self.inverted.clear();
        self.excluded.clear();
    }

    fn is_partial(&self) -> bool {
        self.partial
    }

    fn is_ordered(&self) -> bool {
        self.ordered
    }

    fn extractor_name(&self) -> &str {
        self.extractor.name()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
