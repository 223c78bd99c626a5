//! Monotonic timestamps for stream statistics.

use std::time::Instant;

use once_cell::sync::Lazy;

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic timestamp in nanoseconds since the first call in this process.
pub fn monotonic_timestamp_ns() -> u64 {
    let elapsed = START.elapsed();
    (elapsed.as_secs() * 1_000_000_000) + elapsed.subsec_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_never_go_backwards() {
        let a = monotonic_timestamp_ns();
        let b = monotonic_timestamp_ns();
        assert!(b >= a);
    }
}
