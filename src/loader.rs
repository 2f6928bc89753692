use std::collections::HashMap;
use std::hash::Hash;

use crate::error::Result;

/// Loads entries from an external backing store on cache misses.
///
/// Returning `None` signifies absence; the miss stays a miss.
pub trait CacheLoader<K, V>: Send + Sync {
    /// Loads the value for one key, or `None` when the store has no entry.
    fn load(&self, key: &K) -> Option<V>;

    /// Loads the values for a set of keys. Keys absent from the returned
    /// map are treated as misses. The default loads one key at a time.
    fn load_all(&self, keys: &[K]) -> HashMap<K, V>
    where
        K: Eq + Hash + Clone,
    {
        let mut loaded = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.load(key) {
                loaded.insert(key.clone(), value);
            }
        }
        loaded
    }
}

/// Writes entries through to an external backing store.
///
/// A read-only store signals `Unsupported` from the mutating operations;
/// the bulk helpers tolerate that silently because they iterate collections
/// they do not own, while single-key failures propagate to the caller.
pub trait CacheStore<K, V>: CacheLoader<K, V> {
    /// Persists one entry.
    fn store(&self, key: &K, value: &V) -> Result<()>;

    /// Persists a batch of entries. The default iterates [`store`] and
    /// stops silently on the first `Unsupported`.
    fn store_all(&self, entries: &HashMap<K, V>) -> Result<()>
    where
        K: Eq + Hash,
    {
        for (key, value) in entries {
            match self.store(key, value) {
                Ok(()) => {}
                Err(err) if err.is_unsupported() => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Erases one entry from the store.
    fn erase(&self, key: &K) -> Result<()>;

    /// Erases a batch of entries. The default iterates [`erase`] and stops
    /// silently on the first `Unsupported`.
    fn erase_all(&self, keys: &[K]) -> Result<()> {
        for key in keys {
            match self.erase(key) {
                Ok(()) => {}
                Err(err) if err.is_unsupported() => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
