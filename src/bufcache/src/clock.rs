//! Monotonic millisecond clock shared by dirtied-when stamps and the
//! writeback livelock bound. Comparisons only ever involve values from this
//! one epoch.

use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

pub fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}
