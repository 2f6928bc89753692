//! Global registry of cache statistics, indexed by cache name.
//!
//! Every [`LocalCache`](crate::LocalCache) registers its statistics block
//! here at construction, so monitoring code can query hit rates without a
//! handle to the cache itself.
//!
//! # Examples
//!
//! ```
//! use cachette::stats_registry;
//!
//! if let Some(stats) = stats_registry::get("orders") {
//!     println!("hit rate: {:.2}%", stats.hit_rate() * 100.0);
//! }
//! for name in stats_registry::list() {
//!     println!("cache: {}", name);
//! }
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::stats::CacheStatistics;

static STATS_REGISTRY: Lazy<DashMap<String, Arc<CacheStatistics>>> = Lazy::new(DashMap::new);

/// Registers a cache's statistics under a name, replacing any previous
/// registration with the same name.
pub fn register(name: &str, stats: Arc<CacheStatistics>) {
    STATS_REGISTRY.insert(name.to_string(), stats);
}

/// Returns the statistics registered under `name`, if any.
pub fn get(name: &str) -> Option<Arc<CacheStatistics>> {
    STATS_REGISTRY.get(name).map(|entry| Arc::clone(entry.value()))
}

/// Removes the registration for `name`. Called when a cache is released.
pub fn unregister(name: &str) {
    STATS_REGISTRY.remove(name);
}

/// Lists the names of all registered caches.
pub fn list() -> Vec<String> {
    STATS_REGISTRY.iter().map(|entry| entry.key().clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_register_and_get() {
        let stats = Arc::new(CacheStatistics::new());
        stats.record_hit(0);
        register("registry-test-a", Arc::clone(&stats));

        let fetched = get("registry-test-a").expect("registered stats");
        assert_eq!(fetched.hits(), 1);

        unregister("registry-test-a");
        assert!(get("registry-test-a").is_none());
    }

    #[test]
    #[serial]
    fn test_list_contains_registered_names() {
        register("registry-test-b", Arc::new(CacheStatistics::new()));
        assert!(list().iter().any(|name| name == "registry-test-b"));
        unregister("registry-test-b");
    }

    #[test]
    #[serial]
    fn test_reregistration_replaces() {
        let first = Arc::new(CacheStatistics::new());
        first.record_hit(0);
        register("registry-test-c", first);

        let second = Arc::new(CacheStatistics::new());
        register("registry-test-c", second);

        assert_eq!(get("registry-test-c").unwrap().hits(), 0);
        unregister("registry-test-c");
    }
}
