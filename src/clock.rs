// src/clock.rs

//! Wall-clock time in whole seconds, freezable for tests.
//!
//! All ban arithmetic runs on seconds since the epoch. Tests freeze the
//! clock so escalation sequences are reproducible regardless of how slowly
//! a test host runs. The override is thread-local: freezing the clock in
//! one test cannot leak into tests running on other threads.

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

thread_local! {
    static FROZEN: Cell<Option<i64>> = const { Cell::new(None) };
}

/// Current time in seconds since the epoch.
pub fn now() -> i64 {
    if let Some(frozen) = FROZEN.with(|f| f.get()) {
        return frozen;
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Freeze this thread's clock at `time`. Subsequent [`now`] calls on the
/// same thread return `time` until [`unfreeze`] is called.
pub fn freeze(time: i64) {
    FROZEN.with(|f| f.set(Some(time)));
}

/// Return this thread to the system clock.
pub fn unfreeze() {
    FROZEN.with(|f| f.set(None));
}
