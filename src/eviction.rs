use std::str::FromStr;
use std::sync::Arc;

use crate::entry::Entry;
use crate::error::CacheError;

/// Number of priority buckets used by the hybrid policy (0..=10).
const PRIORITY_BUCKETS: usize = 11;

/// Eviction policy selection.
///
/// The built-ins are dispatched statically on the prune path; `External`
/// delegates the whole eviction decision to an injected implementation.
#[derive(Clone, Default)]
pub enum EvictionPolicyKind<K, V> {
    /// Composite recency/frequency scoring. The default.
    #[default]
    Hybrid,
    /// Evict in ascending last-touch order.
    Lru,
    /// Evict in ascending touch-count order.
    Lfu,
    /// Delegate to an external policy.
    External(Arc<dyn ExternalEvictionPolicy<K, V>>),
}

impl<K, V> std::fmt::Debug for EvictionPolicyKind<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicyKind::Hybrid => write!(f, "Hybrid"),
            EvictionPolicyKind::Lru => write!(f, "LRU"),
            EvictionPolicyKind::Lfu => write!(f, "LFU"),
            EvictionPolicyKind::External(_) => write!(f, "External"),
        }
    }
}

impl<K, V> FromStr for EvictionPolicyKind<K, V> {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hybrid" => Ok(EvictionPolicyKind::Hybrid),
            "lru" => Ok(EvictionPolicyKind::Lru),
            "lfu" => Ok(EvictionPolicyKind::Lfu),
            other => Err(CacheError::InvalidArgument(format!(
                "unknown eviction policy: {other}"
            ))),
        }
    }
}

/// The cache surface an external policy evicts through.
///
/// The policy receives this view while the engine holds its exclusive
/// guard, so everything here is a plain mutation.
pub trait EvictionContext<K, V> {
    /// Units currently held by non-discarded entries.
    fn current_units(&self) -> i64;

    /// Visits every live entry in enumeration order.
    fn for_each_entry(&self, visit: &mut dyn FnMut(&Entry<K, V>));

    /// Evicts the entry for `key`. Returns false when the key is absent.
    fn evict(&mut self, key: &K) -> bool;
}

/// An injected eviction policy.
///
/// [`entry_touched`](Self::entry_touched) fires on every access and
/// mutation; [`request_eviction`](Self::request_eviction) is called when
/// the cache exceeds its high-water mark and is expected to call back
/// into [`EvictionContext::evict`] until at most `maximum_units` remain.
pub trait ExternalEvictionPolicy<K, V>: Send + Sync {
    fn entry_touched(&self, entry: &Entry<K, V>);

    fn request_eviction(&self, context: &mut dyn EvictionContext<K, V>, maximum_units: i64);
}

/// Index of the most significant set bit, `-1` for zero.
#[inline]
pub(crate) fn index_of_msb(n: u64) -> i64 {
    if n == 0 {
        -1
    } else {
        63 - n.leading_zeros() as i64
    }
}

/// Per-entry snapshot the selection functions score against. Taken under
/// the exclusive guard so the numbers are a consistent cut.
#[derive(Clone, Debug)]
pub(crate) struct EvictionCandidate<K> {
    pub key: K,
    pub units: i64,
    pub last_touch: u64,
    pub touch_count: u32,
}

/// Recency half of the hybrid score: how much of the window since the
/// last prune the entry has been active.
fn lru_score(candidate: &EvictionCandidate<impl Clone>, now: u64, last_prune: u64) -> i64 {
    if candidate.last_touch < last_prune {
        return 0;
    }
    let dormant = now.saturating_sub(candidate.last_touch) as f64;
    let window = now.saturating_sub(last_prune) as f64;
    let pct = (window - dormant) / (1.0 + window);
    1 + index_of_msb((pct * pct * 64.0) as u64)
}

/// Frequency half of the hybrid score, normalized against the average
/// touch count.
fn lfu_score(candidate: &EvictionCandidate<impl Clone>, avg_touch: u64) -> i64 {
    let uses = candidate.touch_count as i64;
    if uses == 0 {
        return 0;
    }
    let mut score = 1;
    let avg = avg_touch as i64;
    if uses > avg {
        score += 1;
    }
    let adjusted = 2 * uses - avg;
    if adjusted > 0 {
        score += 1 + index_of_msb(((adjusted * 8) / (1 + avg)) as u64).min(4);
    }
    score
}

/// Eviction priority of one entry: 10 is coldest (first out), 0 hottest.
pub(crate) fn hybrid_priority(
    candidate: &EvictionCandidate<impl Clone>,
    now: u64,
    last_prune: u64,
    avg_touch: u64,
) -> usize {
    let score = 10 - lru_score(candidate, now, last_prune) - lfu_score(candidate, avg_touch);
    score.max(0) as usize
}

/// Chooses the keys the hybrid policy discards to bring `current_units`
/// down to `low_units`.
///
/// Entries are bucketed by priority; whole buckets are discarded from the
/// coldest end, and the bucket straddling the target is drained in
/// enumeration order until the low mark is satisfied.
pub(crate) fn select_hybrid<K: Clone>(
    candidates: &[EvictionCandidate<K>],
    current_units: i64,
    low_units: i64,
    now: u64,
    last_prune: u64,
    avg_touch: u64,
) -> Vec<K> {
    let needed = current_units - low_units;
    if needed <= 0 {
        return Vec::new();
    }

    let mut bucket_units = [0i64; PRIORITY_BUCKETS];
    let priorities: Vec<usize> = candidates
        .iter()
        .map(|candidate| {
            let priority = hybrid_priority(candidate, now, last_prune, avg_touch);
            bucket_units[priority] += candidate.units.max(0);
            priority
        })
        .collect();

    // Smallest cutoff at which the cold-end buckets cover the reduction.
    let mut cutoff = 0;
    let mut cumulative = 0i64;
    for priority in (0..PRIORITY_BUCKETS).rev() {
        cumulative += bucket_units[priority];
        if cumulative >= needed {
            cutoff = priority;
            break;
        }
    }

    let mut evicted = Vec::new();
    let mut reclaimed = 0i64;
    for (candidate, priority) in candidates.iter().zip(&priorities) {
        if *priority > cutoff {
            reclaimed += candidate.units.max(0);
            evicted.push(candidate.key.clone());
        }
    }
    for (candidate, priority) in candidates.iter().zip(&priorities) {
        if reclaimed >= needed {
            break;
        }
        if *priority == cutoff {
            reclaimed += candidate.units.max(0);
            evicted.push(candidate.key.clone());
        }
    }
    evicted
}

/// Chooses keys in ascending last-touch order until the low mark is met.
pub(crate) fn select_lru<K: Clone>(
    candidates: &[EvictionCandidate<K>],
    current_units: i64,
    low_units: i64,
) -> Vec<K> {
    select_ordered(candidates, current_units, low_units, |c| c.last_touch)
}

/// Chooses keys in ascending touch-count order until the low mark is met.
pub(crate) fn select_lfu<K: Clone>(
    candidates: &[EvictionCandidate<K>],
    current_units: i64,
    low_units: i64,
) -> Vec<K> {
    select_ordered(candidates, current_units, low_units, |c| {
        c.touch_count as u64
    })
}

fn select_ordered<K: Clone>(
    candidates: &[EvictionCandidate<K>],
    current_units: i64,
    low_units: i64,
    rank: impl Fn(&EvictionCandidate<K>) -> u64,
) -> Vec<K> {
    let needed = current_units - low_units;
    if needed <= 0 {
        return Vec::new();
    }

    let mut ordered: Vec<&EvictionCandidate<K>> = candidates.iter().collect();
    ordered.sort_by_key(|candidate| rank(candidate));

    let mut evicted = Vec::new();
    let mut reclaimed = 0i64;
    let mut index = 0;
    while reclaimed < needed && index < ordered.len() {
        // Discard the whole tie group together.
        let tied_rank = rank(ordered[index]);
        while index < ordered.len() && rank(ordered[index]) == tied_rank {
            reclaimed += ordered[index].units.max(0);
            evicted.push(ordered[index].key.clone());
            index += 1;
        }
    }
    evicted
}
