use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest backwards clock jump (in milliseconds) that is absorbed rather
/// than reported. Jumps smaller than this return the last observed time;
/// larger jumps are accepted as a real wall-clock change.
const ROLLBACK_TOLERANCE_MILLIS: u64 = 4096;

static LAST_SAFE_MILLIS: AtomicU64 = AtomicU64::new(0);

/// Returns the current wall-clock time in milliseconds since the Unix epoch,
/// corrected so that small clock rollbacks (NTP slews, VM resume glitches)
/// never make time run backwards.
///
/// Expiry deadlines are wall-clock values, so a raw `SystemTime` read that
/// jumps backwards would resurrect already-expired entries. This function
/// clamps the returned value to be monotonic unless the rollback exceeds
/// [`ROLLBACK_TOLERANCE_MILLIS`].
///
/// # Examples
///
/// ```
/// use cachette::time::safe_time_millis;
///
/// let a = safe_time_millis();
/// let b = safe_time_millis();
/// assert!(b >= a);
/// ```
pub fn safe_time_millis() -> u64 {
    let raw = raw_time_millis();
    let mut last = LAST_SAFE_MILLIS.load(Ordering::Relaxed);
    loop {
        if raw <= last && last - raw <= ROLLBACK_TOLERANCE_MILLIS {
            // Within tolerance: hold time still instead of going backwards.
            return last;
        }
        // Forward progress, or a rollback too large to be a glitch (a real
        // wall-clock change): accept the raw reading.
        match LAST_SAFE_MILLIS.compare_exchange_weak(
            last,
            raw,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return raw,
            Err(observed) => last = observed,
        }
    }
}

fn raw_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_within_process() {
        let mut prev = safe_time_millis();
        for _ in 0..1000 {
            let now = safe_time_millis();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn test_tracks_real_time() {
        let before = safe_time_millis();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let after = safe_time_millis();
        assert!(after >= before + 10);
    }
}
