//! # Cachette
//!
//! An in-process, size-limited, optionally-expiring key/value cache engine
//! with pluggable eviction, read-through/write-through backing-store
//! integration, attribute indexes, fine-grained key locking, listener-based
//! change notification, and request bundling for latency amortization.
//!
//! ## Features
//!
//! - **Size-bounded storage**: unit accounting with high/low water marks and
//!   pluggable per-entry cost ([`UnitCalculator`])
//! - **Eviction policies**: Hybrid (recency + frequency), LRU, LFU, or an
//!   injected external policy
//! - **Expiry**: per-entry TTL with lazy flush sweeps and synthetic expiry
//!   events
//! - **Read-through / write-through**: [`CacheLoader`] and [`CacheStore`]
//!   seams, with loader-driven inserts masked from the store
//! - **Secondary indexes**: forward + inverted attribute indexes maintained
//!   incrementally under mutation ([`SimpleCacheIndex`])
//! - **Index-aware queries**: [`Filter`]s narrow candidate keys through the
//!   inverted index before falling back to a scan
//! - **Per-key locking**: re-entrant key locks plus a cache-wide gate
//!   ([`KeyLockManager`])
//! - **Change notification**: key / filter / global listeners with lite and
//!   asynchronous flavors, plus event transformers and mutation triggers
//! - **Request bundling**: adaptive batching of concurrent single-key calls
//!   with an auto-tuned size threshold ([`EntryBundler`], [`KeyBundler`])
//! - **Near caching**: a two-tier [`NearCache`] composing a local front
//!   with a remote back over an [`InvalidationStrategy`]
//!
//! ## Quick start
//!
//! ```
//! use cachette::{EvictionPolicyKind, LocalCache};
//! use std::time::Duration;
//!
//! let cache: LocalCache<String, String> = LocalCache::builder("sessions")
//!     .high_units(10_000)
//!     .expiry_delay(Duration::from_secs(300))
//!     .eviction_policy(EvictionPolicyKind::Hybrid)
//!     .build()
//!     .unwrap();
//!
//! cache.insert("user:1".into(), "alice".into()).unwrap();
//! assert_eq!(cache.get(&"user:1".to_string()), Some("alice".to_string()));
//! assert_eq!(cache.statistics().hits(), 1);
//! ```

mod bundler;
mod entry;
mod error;
mod eviction;
mod extractor;
mod filter;
mod index;
mod listener;
mod loader;
mod local_cache;
mod lock_manager;
mod near_cache;
mod processor;
mod stats;
mod trigger;
mod units;

pub mod stats_registry;
pub mod time;

pub use bundler::{BundlerConfig, BundlerStatistics, EntryBundler, KeyBundler};
pub use entry::{Entry, Ttl};
pub use error::{CacheError, Result};
pub use eviction::{EvictionContext, EvictionPolicyKind, ExternalEvictionPolicy};
pub use extractor::{
    AttributeExtractor, Extracted, IndexAttr, KeyExtractor, ValueExtractor, ValueUpdater,
};
pub use filter::{AlwaysFilter, EqualsFilter, Filter, InFilter, NeverFilter, PredicateFilter};
pub use index::{CacheIndex, IndexMap, SimpleCacheIndex};
pub use listener::{CacheEvent, CacheListener, EventKind, EventTransformer, ListenerRegistry};
pub use loader::{CacheLoader, CacheStore};
pub use local_cache::{LocalCache, LocalCacheBuilder};
pub use lock_manager::{KeyLockManager, WAIT_FOREVER, WAIT_NONE};
pub use near_cache::{InvalidationStrategy, MemberListener, NearCache, RemoteCache};
pub use processor::{
    Aggregator, DynAggregator, DynEntryProcessor, EntryProcessor, InvocableEntry,
    UpdaterProcessor,
};
pub use stats::CacheStatistics;
pub use trigger::{CacheTrigger, PendingAction, TriggerEntry};
pub use units::{UnitCalculator, UnitCalculatorKind};
