//! Timestamps for sources that do not stamp frames themselves.

use std::sync::Arc;
use std::time::Instant;

/// Monotonic clock for frame timestamps
///
/// Clones share the same time zero, so every source stamped from one clock
/// stays ordered against the others.
#[derive(Debug, Clone)]
pub struct PTSClock {
    start: Arc<Instant>,
}

impl PTSClock {
    pub fn new() -> Self {
        Self {
            start: Arc::new(Instant::now()),
        }
    }

    /// Nanoseconds elapsed since the clock was created.
    #[inline]
    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for PTSClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = PTSClock::new();
        let a = clock.now_ns();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.now_ns();
        assert!(b > a);
    }

    #[test]
    fn test_clones_share_time_zero() {
        let clock = PTSClock::new();
        std::thread::sleep(Duration::from_millis(2));
        let other = clock.clone();
        let from_clone = other.now_ns();
        assert!(from_clone >= 2_000_000);
        assert!(clock.now_ns() >= from_clone);
    }
}
