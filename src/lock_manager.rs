use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{CacheError, Result};

/// Wait forever.
pub const WAIT_FOREVER: i64 = -1;
/// Do not wait at all.
pub const WAIT_NONE: i64 = 0;

/// Upper bound on re-entrant lock depth.
const MAX_HOLD_COUNT: u16 = 32767;

/// A blocked locker re-checks ownership at least this often, which is also
/// how quickly a dead owner's lock is reclaimed.
const OWNERSHIP_RECHECK_MILLIS: u64 = 1000;

thread_local! {
    /// Liveness token: dropped when the thread exits, so a `Weak` to it
    /// answers "is the owning thread still alive".
    static LIVENESS: Arc<()> = Arc::new(());

    /// Per-thread gate entry counts, keyed by gate id. Lets a thread that
    /// is already inside a gate re-enter even while a closer is pending.
    static GATE_ENTRIES: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

fn current_liveness() -> Weak<()> {
    LIVENESS.with(Arc::downgrade)
}

/// The thread owning a lock, with enough to detect its death.
#[derive(Clone)]
struct Owner {
    id: ThreadId,
    alive: Weak<()>,
}

impl Owner {
    fn current() -> Self {
        Self {
            id: thread::current().id(),
            alive: current_liveness(),
        }
    }

    fn is_current(&self) -> bool {
        self.id == thread::current().id()
    }

    fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

#[derive(Default)]
struct LockState {
    owner: Option<Owner>,
    hold_count: u16,
    waiters: u32,
}

impl LockState {
    fn is_discardable(&self) -> bool {
        self.hold_count == 0 && self.waiters == 0
    }
}

/// One per-key re-entrant lock: a monitor in the classic sense.
#[derive(Default)]
struct KeyLock {
    state: Mutex<LockState>,
    released: Condvar,
}

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(0);

struct GateState {
    entered: usize,
    closed_by: Option<Owner>,
    close_holds: u32,
    pending_closers: usize,
}

/// Cache-wide fairness gate.
///
/// Per-key lockers `enter`/`exit` in shared mode; a whole-cache locker
/// `close`s the gate, which waits out current entrants and blocks new
/// ones. A pending closer also blocks fresh entrants so it cannot starve,
/// but threads already inside may re-enter.
struct Gate {
    id: u64,
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(GateState {
                entered: 0,
                closed_by: None,
                close_holds: 0,
                pending_closers: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn thread_entries(&self) -> usize {
        GATE_ENTRIES.with(|entries| entries.borrow().get(&self.id).copied().unwrap_or(0))
    }

    fn adjust_thread_entries(&self, delta: isize) {
        GATE_ENTRIES.with(|entries| {
            let mut entries = entries.borrow_mut();
            let count = entries.entry(self.id).or_insert(0);
            *count = (*count as isize + delta).max(0) as usize;
            if *count == 0 {
                entries.remove(&self.id);
            }
        });
    }

    fn enter(&self, wait: &mut WaitBudget) -> bool {
        let reentrant = self.thread_entries() > 0;
        let mut state = self.state.lock();
        loop {
            if matches!(&state.closed_by, Some(owner) if !owner.is_alive()) {
                debug!("gate closer died; reclaiming the gate");
                state.closed_by = None;
                state.close_holds = 0;
                self.changed.notify_all();
            }
            let closed_by_current =
                matches!(&state.closed_by, Some(owner) if owner.is_current());
            let barred = if closed_by_current {
                // The closer itself may lock keys inside its closed gate.
                false
            } else {
                state.closed_by.is_some() || (!reentrant && state.pending_closers > 0)
            };
            if !barred {
                state.entered += 1;
                drop(state);
                self.adjust_thread_entries(1);
                return true;
            }
            if !wait.wait_on(&self.changed, &mut state) {
                return false;
            }
        }
    }

    fn exit(&self) {
        let mut state = self.state.lock();
        state.entered = state.entered.saturating_sub(1);
        if state.entered == 0 {
            self.changed.notify_all();
        }
        drop(state);
        self.adjust_thread_entries(-1);
    }

    fn close(&self, wait: &mut WaitBudget) -> bool {
        let mut state = self.state.lock();
        if let Some(owner) = &state.closed_by {
            if owner.is_current() {
                state.close_holds += 1;
                return true;
            }
        }
        state.pending_closers += 1;
        loop {
            let reclaimed = match &state.closed_by {
                Some(owner) if !owner.is_alive() => true,
                _ => false,
            };
            if reclaimed {
                debug!("gate closer died; reclaiming the gate");
                state.closed_by = None;
                state.close_holds = 0;
            }
            if state.closed_by.is_none() && state.entered == 0 {
                state.closed_by = Some(Owner::current());
                state.close_holds = 1;
                state.pending_closers -= 1;
                return true;
            }
            if !wait.wait_on(&self.changed, &mut state) {
                state.pending_closers -= 1;
                self.changed.notify_all();
                return false;
            }
        }
    }

    fn open(&self) -> bool {
        let mut state = self.state.lock();
        match &state.closed_by {
            Some(owner) if owner.is_current() => {
                state.close_holds -= 1;
                if state.close_holds == 0 {
                    state.closed_by = None;
                    self.changed.notify_all();
                }
                true
            }
            _ => false,
        }
    }
}

/// Remaining wait allowance for one lock call: `-1` is forever, `0` is
/// immediate. Each blocking stretch is capped so ownership (and owner
/// liveness) is re-checked at least once a second.
struct WaitBudget {
    remaining: Option<u64>,
}

impl WaitBudget {
    fn new(wait_millis: i64) -> Self {
        Self {
            remaining: if wait_millis < 0 {
                None
            } else {
                Some(wait_millis as u64)
            },
        }
    }

    /// Waits on `condvar` for one capped stretch. Returns false once the
    /// budget is exhausted.
    fn wait_on<T>(&mut self, condvar: &Condvar, guard: &mut parking_lot::MutexGuard<'_, T>) -> bool {
        let stretch = match self.remaining {
            None => OWNERSHIP_RECHECK_MILLIS,
            Some(0) => return false,
            Some(left) => left.min(OWNERSHIP_RECHECK_MILLIS),
        };
        let start = std::time::Instant::now();
        condvar.wait_for(guard, Duration::from_millis(stretch));
        if let Some(left) = self.remaining {
            let elapsed = start.elapsed().as_millis() as u64;
            self.remaining = Some(left.saturating_sub(elapsed.max(1)));
        }
        true
    }
}

/// Fine-grained key lock manager: per-key re-entrant locks plus a
/// cache-wide gate.
///
/// `lock` waits up to `wait_millis` (`0` returns immediately, `-1` waits
/// indefinitely); [`lock_all`](Self::lock_all) is the whole-cache lock and
/// is exclusive with every per-key lock. Locks are re-entrant per thread
/// with the usual matching-unlock discipline. A lock whose owner thread
/// has exited is silently reclaimed by the next contender.
///
/// Taking the whole-cache lock while holding per-key locks is not
/// supported and will wait out its budget.
pub struct KeyLockManager<K: Eq + Hash> {
    locks: DashMap<K, Arc<KeyLock>>,
    gate: Gate,
}

impl<K: Eq + Hash + Clone> Default for KeyLockManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyLockManager<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            gate: Gate::new(),
        }
    }

    /// Acquires the lock for `key`, waiting up to `wait_millis`.
    ///
    /// Returns `Ok(true)` on acquisition, `Ok(false)` on timeout, and
    /// `Err(Fatal)` if the re-entrancy count would overflow.
    pub fn lock(&self, key: &K, wait_millis: i64) -> Result<bool> {
        let mut wait = WaitBudget::new(wait_millis);
        if !self.gate.enter(&mut wait) {
            return Ok(false);
        }

        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyLock::default()))
            .clone();

        let mut state = lock.state.lock();
        loop {
            match &state.owner {
                None => {
                    state.owner = Some(Owner::current());
                    state.hold_count = 1;
                    return Ok(true);
                }
                Some(owner) if owner.is_current() => {
                    if state.hold_count >= MAX_HOLD_COUNT {
                        drop(state);
                        self.gate.exit();
                        return Err(CacheError::Fatal(format!(
                            "lock hold count overflow ({MAX_HOLD_COUNT})"
                        )));
                    }
                    state.hold_count += 1;
                    return Ok(true);
                }
                Some(owner) if !owner.is_alive() => {
                    // The owner exited without unlocking; release silently.
                    debug!("lock owner thread died; releasing its lock");
                    state.owner = None;
                    state.hold_count = 0;
                }
                Some(_) => {
                    state.waiters += 1;
                    let kept_waiting = wait.wait_on(&lock.released, &mut state);
                    state.waiters -= 1;
                    if !kept_waiting {
                        let discardable = state.is_discardable();
                        drop(state);
                        if discardable {
                            self.discard_if_unused(key, &lock);
                        }
                        self.gate.exit();
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Releases one hold on `key`'s lock. Returns false when the calling
    /// thread does not own the lock.
    pub fn unlock(&self, key: &K) -> bool {
        let lock = match self.locks.get(key) {
            Some(entry) => Arc::clone(entry.value()),
            None => return false,
        };

        let mut state = lock.state.lock();
        match &state.owner {
            Some(owner) if owner.is_current() => {
                state.hold_count -= 1;
                if state.hold_count == 0 {
                    state.owner = None;
                    lock.released.notify_one();
                    let discardable = state.is_discardable();
                    drop(state);
                    if discardable {
                        self.discard_if_unused(key, &lock);
                    }
                }
                self.gate.exit();
                true
            }
            _ => false,
        }
    }

    /// Acquires the whole-cache lock, excluding every per-key locker.
    pub fn lock_all(&self, wait_millis: i64) -> bool {
        let mut wait = WaitBudget::new(wait_millis);
        self.gate.close(&mut wait)
    }

    /// Releases one hold on the whole-cache lock. Returns false when the
    /// calling thread does not hold it.
    pub fn unlock_all(&self) -> bool {
        self.gate.open()
    }

    /// True when the calling thread owns the lock for `key`.
    pub fn is_locked_by_current(&self, key: &K) -> bool {
        self.locks
            .get(key)
            .map(|lock| {
                let state = lock.state.lock();
                matches!(&state.owner, Some(owner) if owner.is_current())
            })
            .unwrap_or(false)
    }

    /// Number of live lock objects; discardable locks are evicted eagerly.
    pub fn lock_object_count(&self) -> usize {
        self.locks.len()
    }

    fn discard_if_unused(&self, key: &K, lock: &Arc<KeyLock>) {
        self.locks.remove_if(key, |_, existing| {
            Arc::ptr_eq(existing, lock) && existing.state.lock().is_discardable()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_lock_unlock_roundtrip() {
        let manager: KeyLockManager<&str> = KeyLockManager::new();
        assert!(manager.lock(&"k", WAIT_NONE).unwrap());
        assert!(manager.is_locked_by_current(&"k"));
        assert!(manager.unlock(&"k"));
        assert!(!manager.is_locked_by_current(&"k"));
        assert_eq!(manager.lock_object_count(), 0);
    }

    #[test]
    fn test_reentrancy_requires_matching_unlocks() {
        let manager: KeyLockManager<&str> = KeyLockManager::new();
        assert!(manager.lock(&"k", WAIT_FOREVER).unwrap());
        assert!(manager.lock(&"k", WAIT_NONE).unwrap());

        assert!(manager.unlock(&"k"));
        assert!(manager.is_locked_by_current(&"k"));
        assert!(manager.unlock(&"k"));
        assert!(!manager.is_locked_by_current(&"k"));
    }

    #[test]
    fn test_unlock_by_non_owner_fails() {
        let manager: Arc<KeyLockManager<&'static str>> = Arc::new(KeyLockManager::new());
        assert!(manager.lock(&"k", WAIT_NONE).unwrap());

        let other = Arc::clone(&manager);
        let stolen = thread::spawn(move || other.unlock(&"k")).join().unwrap();
        assert!(!stolen);
        assert!(manager.unlock(&"k"));
    }

    #[test]
    fn test_contended_lock_times_out() {
        let manager: Arc<KeyLockManager<&'static str>> = Arc::new(KeyLockManager::new());
        assert!(manager.lock(&"k", WAIT_NONE).unwrap());

        let contender = Arc::clone(&manager);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let acquired = contender.lock(&"k", 50).unwrap();
            (acquired, start.elapsed())
        });
        let (acquired, elapsed) = handle.join().unwrap();
        assert!(!acquired);
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(500));

        assert!(manager.unlock(&"k"));
        // Lock is free again for anyone.
        let contender = Arc::clone(&manager);
        assert!(thread::spawn(move || contender.lock(&"k", WAIT_NONE).unwrap())
            .join()
            .unwrap());
    }

    #[test]
    fn test_lock_released_wakes_waiter() {
        let manager: Arc<KeyLockManager<&'static str>> = Arc::new(KeyLockManager::new());
        assert!(manager.lock(&"k", WAIT_NONE).unwrap());

        let contender = Arc::clone(&manager);
        let handle = thread::spawn(move || contender.lock(&"k", 2_000).unwrap());
        thread::sleep(Duration::from_millis(50));
        assert!(manager.unlock(&"k"));
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_dead_owner_lock_is_reclaimed() {
        let manager: Arc<KeyLockManager<&'static str>> = Arc::new(KeyLockManager::new());

        let locker = Arc::clone(&manager);
        thread::spawn(move || {
            assert!(locker.lock(&"k", WAIT_NONE).unwrap());
            // Exits without unlocking.
        })
        .join()
        .unwrap();

        // The next contender detects the dead owner within the re-check cap.
        assert!(manager.lock(&"k", 3_000).unwrap());
        assert!(manager.unlock(&"k"));
    }

    #[test]
    fn test_lock_all_excludes_key_lockers() {
        let manager: Arc<KeyLockManager<&'static str>> = Arc::new(KeyLockManager::new());
        assert!(manager.lock_all(WAIT_NONE));

        let contender = Arc::clone(&manager);
        let blocked = thread::spawn(move || contender.lock(&"k", 50).unwrap())
            .join()
            .unwrap();
        assert!(!blocked);

        assert!(manager.unlock_all());
        let contender = Arc::clone(&manager);
        assert!(thread::spawn(move || {
            let ok = contender.lock(&"k", WAIT_NONE).unwrap();
            if ok {
                contender.unlock(&"k");
            }
            ok
        })
        .join()
        .unwrap());
    }

    #[test]
    fn test_key_locker_excludes_lock_all() {
        let manager: Arc<KeyLockManager<&'static str>> = Arc::new(KeyLockManager::new());

        let locker = Arc::clone(&manager);
        assert!(thread::spawn(move || {
            locker.lock(&"k", WAIT_NONE).unwrap() && !locker.lock_all(50)
        })
        .join()
        .unwrap());
    }

    #[test]
    fn test_lock_all_reentrant() {
        let manager: KeyLockManager<&str> = KeyLockManager::new();
        assert!(manager.lock_all(WAIT_NONE));
        assert!(manager.lock_all(WAIT_NONE));
        assert!(manager.unlock_all());
        // Still closed until the matching open.
        assert!(manager.unlock_all());
        assert!(!manager.unlock_all());
    }

    #[test]
    fn test_many_threads_serialize_on_one_key() {
        let manager: Arc<KeyLockManager<u32>> = Arc::new(KeyLockManager::new());
        let counter = Arc::new(Mutex::new(0u32));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..50 {
                        assert!(manager.lock(&1, WAIT_FOREVER).unwrap());
                        {
                            let mut count = counter.lock();
                            *count += 1;
                        }
                        assert!(manager.unlock(&1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), 400);
        assert_eq!(manager.lock_object_count(), 0);
    }
}
