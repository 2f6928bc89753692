use std::any::Any;

use crate::extractor::ValueUpdater;

/// A cache entry as seen by an [`EntryProcessor`].
///
/// The engine materializes one of these under its exclusive guard (a
/// detached entry with no value when the key is absent), hands it to the
/// processor, and afterwards propagates whatever the processor did through
/// the normal insert/update/remove paths.
pub struct InvocableEntry<'a, K, V> {
    key: &'a K,
    value: Option<V>,
    present: bool,
    mutated: bool,
    removed: bool,
}

impl<'a, K, V> InvocableEntry<'a, K, V> {
    /// Materializes an entry view for `key`. Pass `None` for a detached
    /// entry. Back-tier implementations construct these when servicing
    /// remote invocations.
    pub fn new(key: &'a K, value: Option<V>) -> Self {
        let present = value.is_some();
        Self {
            key,
            value,
            present,
            mutated: false,
            removed: false,
        }
    }

    /// The key the processor was invoked against.
    pub fn key(&self) -> &K {
        self.key
    }

    /// The entry's current value; `None` for a detached (absent) entry or
    /// after [`remove`](Self::remove).
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// True when the entry existed in the cache at invocation time.
    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Sets the entry's value; the engine turns this into an insert or
    /// update when the processor returns.
    pub fn set_value(&mut self, value: V) {
        self.value = Some(value);
        self.mutated = true;
        self.removed = false;
    }

    /// Removes the entry; the engine turns this into a remove when the
    /// processor returns.
    pub fn remove(&mut self) {
        self.value = None;
        self.mutated = true;
        self.removed = true;
    }

    pub(crate) fn outcome(self) -> InvocationOutcome<V> {
        if !self.mutated {
            InvocationOutcome::Untouched
        } else if self.removed {
            InvocationOutcome::Removed
        } else {
            match self.value {
                Some(value) => InvocationOutcome::Stored(value),
                None => InvocationOutcome::Untouched,
            }
        }
    }
}

/// What an invocation did to the entry, to be applied by the engine.
pub(crate) enum InvocationOutcome<V> {
    Untouched,
    Stored(V),
    Removed,
}

/// Processes a single entry under the cache's exclusive guard.
///
/// # Examples
///
/// ```
/// use cachette::{EntryProcessor, InvocableEntry};
///
/// struct Increment;
///
/// impl EntryProcessor<String, i64> for Increment {
///     type Output = i64;
///
///     fn process(&self, entry: &mut InvocableEntry<'_, String, i64>) -> i64 {
///         let next = entry.value().copied().unwrap_or(0) + 1;
///         entry.set_value(next);
///         next
///     }
/// }
/// ```
pub trait EntryProcessor<K, V>: Send + Sync {
    type Output;

    fn process(&self, entry: &mut InvocableEntry<'_, K, V>) -> Self::Output;
}

/// Folds a set of entries into a single result under the shared guard.
pub trait Aggregator<K, V>: Send + Sync {
    type Output;

    fn aggregate(&self, entries: &mut dyn Iterator<Item = (&K, &V)>) -> Self::Output;
}

/// Processor that writes one attribute into the cached value through a
/// [`ValueUpdater`], leaving the rest of the value untouched.
///
/// Returns `true` when the entry was present and updated, `false` when
/// the key was absent.
pub struct UpdaterProcessor<U, A> {
    updater: U,
    attribute: A,
}

impl<U, A> UpdaterProcessor<U, A> {
    pub fn new(updater: U, attribute: A) -> Self {
        Self { updater, attribute }
    }
}

impl<K, V, U, A> EntryProcessor<K, V> for UpdaterProcessor<U, A>
where
    U: ValueUpdater<V, A>,
    A: Clone + Send + Sync,
{
    type Output = bool;

    fn process(&self, entry: &mut InvocableEntry<'_, K, V>) -> bool {
        match entry.value.take() {
            Some(mut value) => {
                self.updater.update(&mut value, self.attribute.clone());
                entry.set_value(value);
                true
            }
            None => false,
        }
    }
}

/// Object-safe form of [`EntryProcessor`] for trait-object seams such as
/// the remote cache. The typed output is boxed as `Any`; callers that know
/// the processor type downcast it back.
pub trait DynEntryProcessor<K, V>: Send + Sync {
    fn process_dyn(&self, entry: &mut InvocableEntry<'_, K, V>) -> Box<dyn Any + Send>;
}

impl<K, V, P> DynEntryProcessor<K, V> for P
where
    P: EntryProcessor<K, V>,
    P::Output: Send + 'static,
{
    fn process_dyn(&self, entry: &mut InvocableEntry<'_, K, V>) -> Box<dyn Any + Send> {
        Box::new(self.process(entry))
    }
}

/// Object-safe form of [`Aggregator`], mirroring [`DynEntryProcessor`].
pub trait DynAggregator<K, V>: Send + Sync {
    fn aggregate_dyn(&self, entries: &mut dyn Iterator<Item = (&K, &V)>) -> Box<dyn Any + Send>;
}

impl<K, V, A> DynAggregator<K, V> for A
where
    A: Aggregator<K, V>,
    A::Output: Send + 'static,
{
    fn aggregate_dyn(&self, entries: &mut dyn Iterator<Item = (&K, &V)>) -> Box<dyn Any + Send> {
        Box::new(self.aggregate(entries))
    }
}
