use crate::error::Result;

/// The change a trigger is asked to vet, before it is applied.
#[derive(Clone, Debug, PartialEq)]
pub enum PendingAction<V> {
    /// Insert or update to the carried value.
    Store(V),
    /// Removal of the entry.
    Remove,
}

/// A pending mutation as seen by a [`CacheTrigger`].
///
/// The trigger observes the original value (the entry's state before the
/// mutation) and may rewrite the pending value or convert the mutation
/// into a removal before anything becomes visible.
pub struct TriggerEntry<'a, K, V> {
    key: &'a K,
    original: Option<&'a V>,
    action: PendingAction<V>,
}

impl<'a, K, V> TriggerEntry<'a, K, V> {
    pub(crate) fn new(key: &'a K, original: Option<&'a V>, action: PendingAction<V>) -> Self {
        Self {
            key,
            original,
            action,
        }
    }

    pub(crate) fn into_action(self) -> PendingAction<V> {
        self.action
    }

    /// The key being mutated.
    pub fn key(&self) -> &K {
        self.key
    }

    /// The entry's value before the mutation, if the entry existed.
    pub fn original_value(&self) -> Option<&V> {
        self.original
    }

    /// True when the entry existed before the mutation.
    pub fn is_original_present(&self) -> bool {
        self.original.is_some()
    }

    /// The pending new value; `None` when the pending change is a removal.
    pub fn value(&self) -> Option<&V> {
        match &self.action {
            PendingAction::Store(value) => Some(value),
            PendingAction::Remove => None,
        }
    }

    /// Rewrites the pending value (turns a pending removal back into a
    /// store).
    pub fn set_value(&mut self, value: V) {
        self.action = PendingAction::Store(value);
    }

    /// Converts the pending change into a removal.
    pub fn remove(&mut self) {
        self.action = PendingAction::Remove;
    }
}

/// Vets mutations before they are applied.
///
/// Returning an error rejects the pending change: the mutation is aborted,
/// the cache keeps its pre-mutation state, and the error surfaces to the
/// caller.
pub trait CacheTrigger<K, V>: Send + Sync {
    fn process(&self, entry: &mut TriggerEntry<'_, K, V>) -> Result<()>;
}
