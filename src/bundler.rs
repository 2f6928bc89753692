use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{CacheError, Result};

/// Master-bundle completions between two auto-adjustments.
const ADJUSTMENT_FREQUENCY: u64 = 128;

/// Relative throughput change below which two cycles count as "level".
const THROUGHPUT_NOISE_FRACTION: f64 = 0.02;

/// Probability of a random nudge when throughput is level.
const NUDGE_PROBABILITY: f64 = 0.1;

/// Size of a random nudge, as a fraction of the current threshold.
const NUDGE_FRACTION: f64 = 0.05;

/// Bundler tuning knobs.
///
/// * `size_threshold` - a bundle closes as soon as it holds this many
///   entries (auto-adjusted at runtime when `auto_adjust` is on)
/// * `thread_threshold` - bundling engages only once this many threads
///   are inside the bundler concurrently; below it every call goes
///   straight through as a singleton
/// * `delay_millis` - how long the first thread into a bundle waits for
///   company before bursting anyway
#[derive(Clone, Copy, Debug)]
pub struct BundlerConfig {
    pub size_threshold: usize,
    pub thread_threshold: usize,
    pub delay_millis: u64,
    pub auto_adjust: bool,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            size_threshold: 10,
            thread_threshold: 4,
            delay_millis: 1,
            auto_adjust: true,
        }
    }
}

impl BundlerConfig {
    fn validate(&self) -> Result<()> {
        if self.size_threshold == 0 {
            return Err(CacheError::InvalidArgument(
                "size_threshold must be positive".into(),
            ));
        }
        if self.thread_threshold == 0 {
            return Err(CacheError::InvalidArgument(
                "thread_threshold must be positive".into(),
            ));
        }
        if self.delay_millis == 0 {
            return Err(CacheError::InvalidArgument(
                "delay_millis must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Cumulative bundler statistics plus the running averages the
/// auto-adjuster feeds on.
#[derive(Clone, Copy, Debug, Default)]
pub struct BundlerStatistics {
    pub burst_count: u64,
    pub total_bundle_size: u64,
    pub total_burst_millis: u64,
    pub total_wait_millis: u64,
}

impl BundlerStatistics {
    pub fn average_bundle_size(&self) -> f64 {
        ratio(self.total_bundle_size, self.burst_count)
    }

    pub fn average_burst_millis(&self) -> f64 {
        ratio(self.total_burst_millis, self.burst_count)
    }

    pub fn average_wait_millis(&self) -> f64 {
        ratio(self.total_wait_millis, self.burst_count)
    }

    /// Entries per second pushed through bursts.
    pub fn average_throughput(&self) -> f64 {
        if self.total_wait_millis == 0 {
            0.0
        } else {
            self.total_bundle_size as f64 * 1000.0 / self.total_wait_millis as f64
        }
    }
}

fn ratio(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

/// Shared machinery of every bundler flavor: tuning state, statistics,
/// active-thread accounting, and the auto-adjustment loop.
struct BundlerCore {
    thread_threshold: usize,
    delay: Duration,
    auto_adjust: bool,
    active_threads: AtomicUsize,
    tuning: Mutex<TuningState>,
}

struct TuningState {
    /// Floating-point internally for sub-unit convergence; reported as an
    /// integer.
    size_threshold: f64,
    /// Zero right after a statistics reset; the first adjustment after a
    /// reset always nudges upward.
    previous_size_threshold: f64,
    previous_throughput: f64,
    last_delta: f64,
    master_completions: u64,
    cycle_size: u64,
    cycle_wait_millis: u64,
    stats: BundlerStatistics,
    rng: fastrand::Rng,
}

impl BundlerCore {
    fn new(config: BundlerConfig, seed: Option<u64>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            thread_threshold: config.thread_threshold,
            delay: Duration::from_millis(config.delay_millis),
            auto_adjust: config.auto_adjust,
            active_threads: AtomicUsize::new(0),
            tuning: Mutex::new(TuningState {
                size_threshold: config.size_threshold as f64,
                previous_size_threshold: 0.0,
                previous_throughput: 0.0,
                last_delta: 0.0,
                master_completions: 0,
                cycle_size: 0,
                cycle_wait_millis: 0,
                stats: BundlerStatistics::default(),
                rng: match seed {
                    Some(seed) => fastrand::Rng::with_seed(seed),
                    None => fastrand::Rng::new(),
                },
            }),
        })
    }

    fn size_threshold(&self) -> usize {
        (self.tuning.lock().size_threshold.max(1.0)) as usize
    }

    fn statistics(&self) -> BundlerStatistics {
        self.tuning.lock().stats
    }

    /// Resets the cumulative statistics and the previous-size baseline the
    /// adjuster compares against.
    fn reset_statistics(&self) {
        let mut tuning = self.tuning.lock();
        tuning.stats = BundlerStatistics::default();
        tuning.previous_size_threshold = 0.0;
        tuning.previous_throughput = 0.0;
        tuning.last_delta = 0.0;
        tuning.master_completions = 0;
        tuning.cycle_size = 0;
        tuning.cycle_wait_millis = 0;
    }

    fn record_burst(&self, master: bool, size: u64, burst_millis: u64, wait_millis: u64) {
        let mut tuning = self.tuning.lock();
        tuning.stats.burst_count += 1;
        tuning.stats.total_bundle_size += size;
        tuning.stats.total_burst_millis += burst_millis;
        tuning.stats.total_wait_millis += wait_millis;
        if master {
            tuning.cycle_size += size;
            tuning.cycle_wait_millis += wait_millis;
            tuning.master_completions += 1;
            if self.auto_adjust && tuning.master_completions >= ADJUSTMENT_FREQUENCY {
                adjust(&mut tuning);
            }
        }
    }
}

/// One auto-adjustment step over the just-finished measurement cycle.
fn adjust(tuning: &mut TuningState) {
    let throughput = if tuning.cycle_wait_millis > 0 {
        tuning.cycle_size as f64 * 1000.0 / tuning.cycle_wait_millis as f64
    } else {
        tuning.previous_throughput
    };

    let threshold = tuning.size_threshold;
    if tuning.previous_size_threshold == 0.0 {
        // First adjustment after a reset: probe upward.
        let delta = (0.1 * threshold).max(1.0);
        tuning.size_threshold = threshold + delta;
        tuning.last_delta = delta;
    } else {
        let previous = tuning.previous_throughput;
        let average = (throughput + previous) / 2.0;
        let delta_throughput = throughput - previous;
        if average <= 0.0 || delta_throughput.abs() <= THROUGHPUT_NOISE_FRACTION * average {
            // Level: occasionally shake the threshold loose so it cannot
            // sit forever on a local plateau.
            if tuning.rng.f64() < NUDGE_PROBABILITY {
                let sign = if tuning.rng.bool() { 1.0 } else { -1.0 };
                let delta = sign * NUDGE_FRACTION * threshold;
                tuning.size_threshold = threshold + delta;
                tuning.last_delta = delta;
            }
        } else if delta_throughput > 0.0 {
            // Improving: keep going the same way at the same rate.
            tuning.size_threshold = threshold + tuning.last_delta;
        } else {
            // Regressed: turn around at half the rate.
            tuning.last_delta = -tuning.last_delta / 2.0;
            tuning.size_threshold = threshold + tuning.last_delta;
        }
    }
    if tuning.size_threshold < 1.0 {
        tuning.size_threshold = 1.0;
    }

    trace!(
        threshold = tuning.size_threshold,
        throughput,
        "bundler threshold adjusted"
    );
    tuning.previous_size_threshold = threshold;
    tuning.previous_throughput = throughput;
    tuning.master_completions = 0;
    tuning.cycle_size = 0;
    tuning.cycle_wait_millis = 0;
}

/// Bundle lifecycle. Only an `Open` bundle accepts additions; only
/// `Pending` triggers a burst; `Processed`/`Exception` drain back to
/// `Open` once the last participant leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BundleStatus {
    Open,
    Pending,
    Processed,
    Exception,
}

struct BundleState<S, R> {
    status: BundleStatus,
    staged: S,
    staged_len: usize,
    participants: usize,
    opened_at: Option<Instant>,
    result: Option<Arc<R>>,
}

struct Bundle<S, R> {
    master: bool,
    state: Mutex<BundleState<S, R>>,
    changed: Condvar,
}

impl<S: Default, R> Bundle<S, R> {
    fn new(master: bool) -> Self {
        Self {
            master,
            state: Mutex::new(BundleState {
                status: BundleStatus::Open,
                staged: S::default(),
                staged_len: 0,
                participants: 0,
                opened_at: None,
                result: None,
            }),
            changed: Condvar::new(),
        }
    }
}

/// What a participating thread should do after staging its work.
enum Role {
    /// Flip the bundle and execute the burst.
    Burst,
    /// Wait for the burst thread and share its outcome.
    Wait,
}

/// Outcome a participant observes once the bundle settles.
enum Settled<R> {
    Done(Option<Arc<R>>),
    Failed,
}

/// Generic bundle pool driving the state machine; the concrete bundlers
/// below supply the staging container and the burst call.
struct BundlePool<S, R> {
    bundles: Mutex<Vec<Arc<Bundle<S, R>>>>,
    next_slot: AtomicUsize,
}

impl<S: Default, R> BundlePool<S, R> {
    fn new() -> Self {
        Self {
            bundles: Mutex::new(vec![Arc::new(Bundle::new(true))]),
            next_slot: AtomicUsize::new(0),
        }
    }

    /// Cycles from the last active position and returns the first bundle
    /// that accepted the staged addition; grows the pool when every
    /// bundle is busy.
    fn stage<F>(&self, core: &BundlerCore, mut add: F) -> (Arc<Bundle<S, R>>, Role)
    where
        F: FnMut(&mut S) -> usize,
    {
        loop {
            let snapshot: Vec<Arc<Bundle<S, R>>> = self.bundles.lock().clone();
            let start = self.next_slot.load(Ordering::Relaxed);
            for offset in 0..snapshot.len() {
                let slot = (start + offset) % snapshot.len();
                let bundle = &snapshot[slot];
                let mut state = bundle.state.lock();
                if state.status != BundleStatus::Open {
                    continue;
                }
                self.next_slot.store(slot, Ordering::Relaxed);
                let added = add(&mut state.staged);
                state.staged_len += added;
                state.participants += 1;
                let first = state.participants == 1;
                if first {
                    state.opened_at = Some(Instant::now());
                }
                if state.staged_len >= core.size_threshold() {
                    // Threshold met: close immediately; the closer bursts.
                    state.status = BundleStatus::Pending;
                    bundle.changed.notify_all();
                    drop(state);
                    return (Arc::clone(bundle), Role::Burst);
                }
                if first {
                    // Leader: wait out the delay, then burst if nobody else
                    // closed the bundle first.
                    let deadline = Instant::now() + core.delay;
                    while state.status == BundleStatus::Open {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        bundle.changed.wait_for(&mut state, deadline - now);
                    }
                    if state.status == BundleStatus::Open {
                        state.status = BundleStatus::Pending;
                        bundle.changed.notify_all();
                        drop(state);
                        return (Arc::clone(bundle), Role::Burst);
                    }
                    drop(state);
                    return (Arc::clone(bundle), Role::Wait);
                }
                drop(state);
                return (Arc::clone(bundle), Role::Wait);
            }

            // Every bundle is mid-flight; add a fresh one and retry.
            let mut bundles = self.bundles.lock();
            if bundles.iter().all(|bundle| {
                bundle.state.lock().status != BundleStatus::Open
            }) {
                bundles.push(Arc::new(Bundle::new(false)));
            }
        }
    }

    /// Runs the burst for a bundle this thread flipped to `Pending`.
    fn burst<F>(
        &self,
        core: &BundlerCore,
        bundle: &Arc<Bundle<S, R>>,
        execute: F,
    ) -> Settled<R>
    where
        F: FnOnce(S) -> Result<R>,
    {
        let (staged, size, wait_start) = {
            let mut state = bundle.state.lock();
            debug_assert_eq!(state.status, BundleStatus::Pending);
            let staged = std::mem::take(&mut state.staged);
            let size = state.staged_len;
            (staged, size, state.opened_at.take())
        };

        let burst_start = Instant::now();
        let outcome = execute(staged);
        let burst_millis = burst_start.elapsed().as_millis() as u64;
        let wait_millis = wait_start
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(burst_millis)
            .max(1);

        let mut state = bundle.state.lock();
        let settled = match outcome {
            Ok(result) => {
                let result = Arc::new(result);
                state.status = BundleStatus::Processed;
                state.result = Some(Arc::clone(&result));
                core.record_burst(bundle.master, size as u64, burst_millis, wait_millis);
                Settled::Done(Some(result))
            }
            Err(_) => {
                state.status = BundleStatus::Exception;
                state.result = None;
                Settled::Failed
            }
        };
        bundle.changed.notify_all();
        self.leave(bundle, state);
        settled
    }

    /// Waits for the burst thread to settle the bundle.
    fn wait(&self, bundle: &Arc<Bundle<S, R>>) -> Settled<R> {
        let mut state = bundle.state.lock();
        while !matches!(
            state.status,
            BundleStatus::Processed | BundleStatus::Exception
        ) {
            bundle.changed.wait(&mut state);
        }
        let settled = match state.status {
            BundleStatus::Processed => Settled::Done(state.result.clone()),
            _ => Settled::Failed,
        };
        self.leave(bundle, state);
        settled
    }

    /// Departs the bundle; the last participant out re-opens it.
    fn leave(&self, bundle: &Arc<Bundle<S, R>>, mut state: parking_lot::MutexGuard<'_, BundleState<S, R>>) {
        state.participants -= 1;
        if state.participants == 0
            && matches!(
                state.status,
                BundleStatus::Processed | BundleStatus::Exception
            )
        {
            state.status = BundleStatus::Open;
            state.staged = S::default();
            state.staged_len = 0;
            state.result = None;
            state.opened_at = None;
            bundle.changed.notify_all();
        }
    }
}

/// Guard bumping the bundler's concurrent-thread count for one call.
///
/// The count is incremented before the threshold check, so of a batch of
/// simultaneous callers at most the first observes itself alone and takes
/// the un-bundled fast path.
struct ActiveThread<'a>(&'a AtomicUsize);

impl<'a> ActiveThread<'a> {
    /// Enters the bundler, returning the guard and the concurrency level
    /// including this call.
    fn enter(counter: &'a AtomicUsize) -> (Self, usize) {
        let concurrency = counter.fetch_add(1, Ordering::Relaxed) + 1;
        (Self(counter), concurrency)
    }
}

impl Drop for ActiveThread<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Coalesces concurrent single-entry writes into bulk calls.
///
/// The bulk operation must be idempotent per entry: after a failed burst
/// every participant re-issues its own entry as a singleton, so an entry
/// can reach the backend twice across the failure boundary.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use std::sync::{Arc, Mutex};
/// use cachette::{BundlerConfig, EntryBundler};
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&seen);
/// let bundler = EntryBundler::new(
///     BundlerConfig { thread_threshold: 1, ..Default::default() },
///     move |batch: HashMap<u32, String>| {
///         sink.lock().unwrap().extend(batch);
///         Ok(())
///     },
/// ).unwrap();
///
/// bundler.process(1, "one".to_string()).unwrap();
/// assert_eq!(seen.lock().unwrap().len(), 1);
/// ```
pub struct EntryBundler<K, V> {
    core: BundlerCore,
    pool: BundlePool<HashMap<K, V>, ()>,
    op: Arc<dyn Fn(HashMap<K, V>) -> Result<()> + Send + Sync>,
}

impl<K, V> EntryBundler<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        config: BundlerConfig,
        op: impl Fn(HashMap<K, V>) -> Result<()> + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::with_seed_internal(config, None, op)
    }

    /// Like [`new`](Self::new) but with a deterministic RNG for the
    /// auto-adjustment nudge.
    pub fn with_seed(
        config: BundlerConfig,
        seed: u64,
        op: impl Fn(HashMap<K, V>) -> Result<()> + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::with_seed_internal(config, Some(seed), op)
    }

    fn with_seed_internal(
        config: BundlerConfig,
        seed: Option<u64>,
        op: impl Fn(HashMap<K, V>) -> Result<()> + Send + Sync + 'static,
    ) -> Result<Self> {
        Ok(Self {
            core: BundlerCore::new(config, seed)?,
            pool: BundlePool::new(),
            op: Arc::new(op),
        })
    }

    /// Processes one entry, possibly bundled with concurrent callers.
    pub fn process(&self, key: K, value: V) -> Result<()> {
        self.process_all(HashMap::from_iter([(key, value)]))
    }

    /// Processes a batch of entries, possibly bundled with concurrent
    /// callers.
    pub fn process_all(&self, entries: HashMap<K, V>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let (_active, concurrency) = ActiveThread::enter(&self.core.active_threads);
        if concurrency < self.core.thread_threshold {
            // Lightly loaded: skip bundling entirely.
            return (self.op)(entries);
        }

        let (bundle, role) = self.pool.stage(&self.core, |staged| {
            let before = staged.len();
            staged.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
            staged.len() - before
        });

        let settled = match role {
            Role::Burst => self.pool.burst(&self.core, &bundle, |staged| {
                (self.op)(staged).map(|_| ())
            }),
            Role::Wait => self.pool.wait(&bundle),
        };

        match settled {
            Settled::Done(_) => Ok(()),
            // Burst failure: fall back to un-bundled execution, once.
            Settled::Failed => (self.op)(entries),
        }
    }

    /// Current (auto-adjusted) size threshold, reported as an integer.
    pub fn size_threshold(&self) -> usize {
        self.core.size_threshold()
    }

    pub fn statistics(&self) -> BundlerStatistics {
        self.core.statistics()
    }

    pub fn reset_statistics(&self) {
        self.core.reset_statistics();
    }
}

/// Coalesces concurrent single-key reads into bulk load calls.
///
/// Mirrors [`EntryBundler`] for get-style operations: the bulk call maps
/// a key set to the values found, and each waiter picks its own key out
/// of the shared result.
pub struct KeyBundler<K, V> {
    core: BundlerCore,
    pool: BundlePool<Vec<K>, HashMap<K, V>>,
    op: Arc<dyn Fn(Vec<K>) -> Result<HashMap<K, V>> + Send + Sync>,
}

impl<K, V> KeyBundler<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        config: BundlerConfig,
        op: impl Fn(Vec<K>) -> Result<HashMap<K, V>> + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::with_seed_internal(config, None, op)
    }

    pub fn with_seed(
        config: BundlerConfig,
        seed: u64,
        op: impl Fn(Vec<K>) -> Result<HashMap<K, V>> + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::with_seed_internal(config, Some(seed), op)
    }

    fn with_seed_internal(
        config: BundlerConfig,
        seed: Option<u64>,
        op: impl Fn(Vec<K>) -> Result<HashMap<K, V>> + Send + Sync + 'static,
    ) -> Result<Self> {
        Ok(Self {
            core: BundlerCore::new(config, seed)?,
            pool: BundlePool::new(),
            op: Arc::new(op),
        })
    }

    /// Loads one key, possibly bundled with concurrent callers.
    pub fn process(&self, key: K) -> Result<Option<V>> {
        let mut loaded = self.process_all(vec![key.clone()])?;
        Ok(loaded.remove(&key))
    }

    /// Loads a set of keys, possibly bundled with concurrent callers.
    pub fn process_all(&self, keys: Vec<K>) -> Result<HashMap<K, V>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let (_active, concurrency) = ActiveThread::enter(&self.core.active_threads);
        if concurrency < self.core.thread_threshold {
            // Lightly loaded: skip bundling entirely.
            return (self.op)(keys);
        }

        let (bundle, role) = self.pool.stage(&self.core, |staged| {
            staged.extend(keys.iter().cloned());
            keys.len()
        });

        let settled = match role {
            Role::Burst => self
                .pool
                .burst(&self.core, &bundle, |staged| (self.op)(staged)),
            Role::Wait => self.pool.wait(&bundle),
        };

        match settled {
            Settled::Done(result) => {
                let result = result.unwrap_or_default();
                Ok(keys
                    .iter()
                    .filter_map(|key| result.get(key).map(|v| (key.clone(), v.clone())))
                    .collect())
            }
            // Burst failure: fall back to un-bundled execution, once.
            Settled::Failed => (self.op)(keys),
        }
    }

    pub fn size_threshold(&self) -> usize {
        self.core.size_threshold()
    }

    pub fn statistics(&self) -> BundlerStatistics {
        self.core.statistics()
    }

    pub fn reset_statistics(&self) {
        self.core.reset_statistics();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config(size: usize, threads: usize, delay: u64) -> BundlerConfig {
        BundlerConfig {
            size_threshold: size,
            thread_threshold: threads,
            delay_millis: delay,
            auto_adjust: false,
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = BundlerConfig {
            size_threshold: 0,
            ..Default::default()
        };
        assert!(EntryBundler::<u32, u32>::new(bad, |_| Ok(())).is_err());

        let bad = BundlerConfig {
            delay_millis: 0,
            ..Default::default()
        };
        assert!(KeyBundler::<u32, u32>::new(bad, |_| Ok(HashMap::new())).is_err());
    }

    #[test]
    fn test_lightly_loaded_fast_path() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let bundler = {
            let calls = Arc::clone(&calls);
            let sizes = Arc::clone(&sizes);
            EntryBundler::new(config(50, 4, 5), move |batch: HashMap<u32, u32>| {
                calls.fetch_add(1, Ordering::SeqCst);
                sizes.lock().push(batch.len());
                Ok(())
            })
            .unwrap()
        };

        // One thread, threshold four: every call is a singleton.
        for i in 0..5 {
            bundler.process(i, i).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(sizes.lock().iter().all(|&size| size == 1));
        // Fast path records no bursts.
        assert_eq!(bundler.statistics().burst_count, 0);
    }

    #[test]
    fn test_concurrent_entries_coalesce() {
        let delivered = Arc::new(Mutex::new(HashMap::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let bundler = {
            let delivered = Arc::clone(&delivered);
            let calls = Arc::clone(&calls);
            Arc::new(
                EntryBundler::new(config(50, 1, 20), move |batch: HashMap<u32, String>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let mut sink = delivered.lock();
                    for (k, v) in batch {
                        *sink.entry(k).or_insert(0) += 1;
                        let _ = v;
                    }
                    Ok(())
                })
                .unwrap(),
            )
        };

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let bundler = Arc::clone(&bundler);
                thread::spawn(move || bundler.process(i, format!("v{i}")).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let sink = delivered.lock();
        assert_eq!(sink.len(), 20);
        // No entry delivered twice, and far fewer calls than entries.
        assert!(sink.values().all(|&count| count == 1));
        assert!(calls.load(Ordering::SeqCst) < 20);
    }

    #[test]
    fn test_size_threshold_closes_bundle() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let bundler = {
            let sizes = Arc::clone(&sizes);
            Arc::new(
                // Long delay: only the size threshold can close a bundle
                // quickly.
                EntryBundler::new(config(4, 1, 2_000), move |batch: HashMap<u32, u32>| {
                    sizes.lock().push(batch.len());
                    Ok(())
                })
                .unwrap(),
            )
        };

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let bundler = Arc::clone(&bundler);
                thread::spawn(move || bundler.process(i, i).unwrap())
            })
            .collect();
        let start = Instant::now();
        for handle in handles {
            handle.join().unwrap();
        }
        // Bundles filled and burst well before the delay expired.
        assert!(start.elapsed() < Duration::from_millis(1_500));
        assert_eq!(sizes.lock().iter().sum::<usize>(), 8);
    }

    #[test]
    fn test_burst_failure_unbundles_each_caller() {
        let failures = Arc::new(AtomicUsize::new(0));
        let singles = Arc::new(Mutex::new(Vec::new()));
        let bundler = {
            let failures = Arc::clone(&failures);
            let singles = Arc::clone(&singles);
            Arc::new(
                EntryBundler::new(config(50, 1, 30), move |batch: HashMap<u32, u32>| {
                    if batch.len() > 1 {
                        failures.fetch_add(1, Ordering::SeqCst);
                        return Err(CacheError::StoreFailure("burst refused".into()));
                    }
                    singles.lock().extend(batch.into_keys());
                    Ok(())
                })
                .unwrap(),
            )
        };

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let bundler = Arc::clone(&bundler);
                thread::spawn(move || bundler.process(i, i))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        // At least one multi-entry burst failed, and every key was then
        // retried exactly once as a singleton.
        let mut retried = singles.lock().clone();
        retried.sort_unstable();
        if failures.load(Ordering::SeqCst) > 0 {
            assert!(!retried.is_empty());
        }
        let mut unique = retried.clone();
        unique.dedup();
        assert_eq!(retried, unique);
    }

    #[test]
    fn test_key_bundler_returns_each_callers_value() {
        let bundler = Arc::new(
            KeyBundler::new(config(100, 1, 20), |keys: Vec<u32>| {
                Ok(keys.into_iter().map(|k| (k, k * 10)).collect())
            })
            .unwrap(),
        );

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let bundler = Arc::clone(&bundler);
                thread::spawn(move || bundler.process(i).unwrap())
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), Some(i as u32 * 10));
        }
    }

    #[test]
    fn test_key_bundler_missing_keys_are_absent() {
        let bundler = KeyBundler::new(config(10, 1, 5), |keys: Vec<u32>| {
            Ok(keys.into_iter().filter(|k| k % 2 == 0).map(|k| (k, k)).collect())
        })
        .unwrap();

        // Single caller still goes through the bundling path with
        // thread_threshold one.
        assert_eq!(bundler.process(2).unwrap(), Some(2));
        assert_eq!(bundler.process(3).unwrap(), None);
    }

    #[test]
    fn test_statistics_accumulate() {
        let bundler = Arc::new(
            EntryBundler::new(config(100, 1, 5), |_batch: HashMap<u32, u32>| Ok(()))
                .unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let bundler = Arc::clone(&bundler);
                thread::spawn(move || bundler.process(i, i).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = bundler.statistics();
        assert!(stats.burst_count >= 1);
        assert_eq!(stats.total_bundle_size, 4);
        assert!(stats.average_bundle_size() >= 1.0);

        bundler.reset_statistics();
        assert_eq!(bundler.statistics().burst_count, 0);
    }

    #[test]
    fn test_first_adjustment_probes_upward() {
        let mut tuning = TuningState {
            size_threshold: 10.0,
            previous_size_threshold: 0.0,
            previous_throughput: 0.0,
            last_delta: 0.0,
            master_completions: ADJUSTMENT_FREQUENCY,
            cycle_size: 1000,
            cycle_wait_millis: 100,
            stats: BundlerStatistics::default(),
            rng: fastrand::Rng::with_seed(7),
        };
        adjust(&mut tuning);
        assert!((tuning.size_threshold - 11.0).abs() < 1e-9);
        assert_eq!(tuning.master_completions, 0);
        assert!(tuning.previous_throughput > 0.0);
    }

    #[test]
    fn test_adjustment_reverses_on_regression() {
        let mut tuning = TuningState {
            size_threshold: 11.0,
            previous_size_threshold: 10.0,
            previous_throughput: 10_000.0,
            last_delta: 1.0,
            master_completions: ADJUSTMENT_FREQUENCY,
            // Throughput collapsed versus the previous cycle.
            cycle_size: 100,
            cycle_wait_millis: 1_000,
            stats: BundlerStatistics::default(),
            rng: fastrand::Rng::with_seed(7),
        };
        adjust(&mut tuning);
        // Reversed at half the previous rate: 11.0 - 0.5.
        assert!((tuning.size_threshold - 10.5).abs() < 1e-9);
        assert!((tuning.last_delta + 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_adjustment_continues_on_improvement() {
        let mut tuning = TuningState {
            size_threshold: 11.0,
            previous_size_threshold: 10.0,
            previous_throughput: 1_000.0,
            last_delta: 1.0,
            master_completions: ADJUSTMENT_FREQUENCY,
            cycle_size: 2_000,
            cycle_wait_millis: 1_000,
            stats: BundlerStatistics::default(),
            rng: fastrand::Rng::with_seed(7),
        };
        adjust(&mut tuning);
        assert!((tuning.size_threshold - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_never_drops_below_one() {
        let mut tuning = TuningState {
            size_threshold: 1.2,
            previous_size_threshold: 2.0,
            previous_throughput: 10_000.0,
            last_delta: -4.0,
            master_completions: ADJUSTMENT_FREQUENCY,
            cycle_size: 10,
            cycle_wait_millis: 1_000,
            stats: BundlerStatistics::default(),
            rng: fastrand::Rng::with_seed(7),
        };
        adjust(&mut tuning);
        assert!(tuning.size_threshold >= 1.0);
    }
}
