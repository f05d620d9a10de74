//! Monotonic timers for the scheduler's sleep and timed-wait bookkeeping.
//!
//! All deadlines in the scheduler are expressed against these clocks: sleep
//! expiry in microseconds, timed condition waits in milliseconds. Both count
//! from the first use in the process, so values stay small and wrap-free.

use std::time::Instant;

use once_cell::sync::Lazy;

static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

/// Microseconds elapsed since the process clock was first read.
pub fn now_micros() -> u64 {
    u64::try_from(STARTED_AT.elapsed().as_micros()).unwrap()
}

/// Milliseconds elapsed since the process clock was first read.
pub fn now_millis() -> u64 {
    u64::try_from(STARTED_AT.elapsed().as_millis()).unwrap()
}
