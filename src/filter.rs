use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use crate::extractor::{Extracted, ValueExtractor};
use crate::index::{IndexMap, SimpleCacheIndex};

/// A predicate over cache entries, optionally index-aware.
///
/// Queries first offer the attached indexes to the filter through
/// [`apply_index`](Filter::apply_index); a filter that cannot use them
/// returns `None` and the engine falls back to a full scan with
/// [`evaluate`](Filter::evaluate).
pub trait Filter<K, V>: Send + Sync {
    /// Evaluates the filter against one entry.
    fn evaluate(&self, key: &K, value: &V) -> bool;

    /// Narrows the candidate key set using the cache's indexes.
    ///
    /// Returns `Some(keys)` when an appropriate index exists, `None` when
    /// the filter could not be index-optimized. The default is not
    /// index-aware.
    fn apply_index(&self, _indexes: &IndexMap<K, V>) -> Option<HashSet<K>> {
        None
    }
}

/// Matches every entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysFilter;

impl<K, V> Filter<K, V> for AlwaysFilter {
    fn evaluate(&self, _key: &K, _value: &V) -> bool {
        true
    }
}

/// Matches no entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverFilter;

impl<K, V> Filter<K, V> for NeverFilter {
    fn evaluate(&self, _key: &K, _value: &V) -> bool {
        false
    }

    fn apply_index(&self, _indexes: &IndexMap<K, V>) -> Option<HashSet<K>> {
        Some(HashSet::new())
    }
}

/// Equality filter over an extracted attribute.
///
/// When the cache has an index registered over the same extractor (matched
/// by name), the filter answers straight from the inverted map; otherwise
/// it extracts per entry.
///
/// For multi-valued attributes the filter matches when any element equals
/// the target.
pub struct EqualsFilter<X, A> {
    extractor: X,
    target: A,
}

impl<X, A> EqualsFilter<X, A> {
    pub fn new(extractor: X, target: A) -> Self {
        Self { extractor, target }
    }
}

impl<K, V, X> Filter<K, V> for EqualsFilter<X, X::Attr>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: 'static,
    X: ValueExtractor<K, V> + 'static,
{
    fn evaluate(&self, key: &K, value: &V) -> bool {
        match self.extractor.extract(key, value) {
            Extracted::Value(attr) => attr == self.target,
            Extracted::Collection(attrs) => attrs.iter().any(|attr| *attr == self.target),
            Extracted::None => false,
        }
    }

    fn apply_index(&self, indexes: &IndexMap<K, V>) -> Option<HashSet<K>> {
        let index = indexes.get(self.extractor.name())?;
        let index = index
            .as_any()
            .downcast_ref::<SimpleCacheIndex<K, V, X>>()?;
        Some(index.keys_for(&self.target).cloned().unwrap_or_default())
    }
}

/// Disjunction of equality targets over one extractor: matches when the
/// attribute equals any of the targets.
pub struct InFilter<X, A> {
    extractor: X,
    targets: Vec<A>,
}

impl<X, A> InFilter<X, A> {
    pub fn new(extractor: X, targets: Vec<A>) -> Self {
        Self { extractor, targets }
    }
}

impl<K, V, X> Filter<K, V> for InFilter<X, X::Attr>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: 'static,
    X: ValueExtractor<K, V> + 'static,
{
    fn evaluate(&self, key: &K, value: &V) -> bool {
        match self.extractor.extract(key, value) {
            Extracted::Value(attr) => self.targets.contains(&attr),
            Extracted::Collection(attrs) => {
                attrs.iter().any(|attr| self.targets.contains(attr))
            }
            Extracted::None => false,
        }
    }

    fn apply_index(&self, indexes: &IndexMap<K, V>) -> Option<HashSet<K>> {
        let index = indexes.get(self.extractor.name())?;
        let index = index
            .as_any()
            .downcast_ref::<SimpleCacheIndex<K, V, X>>()?;
        let mut keys = HashSet::new();
        for target in &self.targets {
            if let Some(bucket) = index.keys_for(target) {
                keys.extend(bucket.iter().cloned());
            }
        }
        Some(keys)
    }
}

/// Closure-backed filter for ad-hoc predicates; never index-aware.
pub struct PredicateFilter<K, V> {
    predicate: Arc<dyn Fn(&K, &V) -> bool + Send + Sync>,
}

impl<K, V> PredicateFilter<K, V> {
    pub fn new(predicate: impl Fn(&K, &V) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

impl<K, V> Clone for PredicateFilter<K, V> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<K: Send + Sync, V: Send + Sync> Filter<K, V> for PredicateFilter<K, V> {
    fn evaluate(&self, key: &K, value: &V) -> bool {
        (self.predicate)(key, value)
    }
}
