//! Injectable time sources.
//!
//! Caches and the workflow manager take a [`Clock`] so tests can drive time
//! deterministically; production code uses [`system_clock`].

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Shared time provider.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall-clock UTC time.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Fixed clock for tests.
pub fn fixed_clock(at: DateTime<Utc>) -> Clock {
    Arc::new(move || at)
}

/// Process CPU time in milliseconds. Unix reads the process CPU clock;
/// elsewhere the monotonic wall clock stands in.
#[cfg(unix)]
pub fn process_cpu_ms() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes into the provided timespec and returns
    // non-zero only for an invalid clock id.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return 0.0;
    }
    ts.tv_sec as f64 * 1000.0 + ts.tv_nsec as f64 / 1_000_000.0
}

#[cfg(not(unix))]
pub fn process_cpu_ms() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}
