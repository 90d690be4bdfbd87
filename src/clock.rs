//! Time source
//!
//! All replicated timestamps are unix nanoseconds taken from a [`Clock`]. The
//! manual variant lets tests drive LWW ordering, GC horizons and key expiry
//! deterministically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 2010-01-01 00:00:00 UTC, the key expiry epoch.
pub const KEY_EPOCH: i64 = 1_262_304_000;

/// 2018-01-01 00:00:00 UTC, the message ID epoch.
pub const MIN_TIME: i64 = 1_514_764_800;

/// 2066-01-01 00:00:00 UTC.
pub const MAX_TIME: i64 = 3_029_529_600;

#[derive(Clone, Debug, Default)]
pub enum Clock {
    #[default]
    System,
    Manual(Arc<AtomicI64>),
}

impl Clock {
    /// Manual clock starting at the given unix nanoseconds.
    pub fn manual(start: i64) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start)))
    }

    /// Unix nanoseconds.
    pub fn now(&self) -> i64 {
        match self {
            Clock::System => now_nanos(),
            Clock::Manual(t) => t.load(Ordering::Acquire),
        }
    }

    /// Unix seconds.
    pub fn now_secs(&self) -> i64 {
        self.now() / 1_000_000_000
    }

    /// Moves a manual clock forward; no-op for the system clock.
    pub fn advance(&self, by: Duration) {
        if let Clock::Manual(t) = self {
            t.fetch_add(by.as_nanos() as i64, Ordering::AcqRel);
        }
    }

    pub fn set(&self, nanos: i64) {
        if let Clock::Manual(t) = self {
            t.store(nanos, Ordering::Release);
        }
    }
}

/// Wall clock unix nanoseconds.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Wall clock unix seconds.
pub fn now_secs() -> i64 {
    now_nanos() / 1_000_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = Clock::manual(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(Duration::from_nanos(500));
        assert_eq!(clock.now(), 1_500);

        let shared = clock.clone();
        shared.set(42);
        assert_eq!(clock.now(), 42);
    }

    #[test]
    fn test_system_clock_after_min_time() {
        assert!(Clock::System.now_secs() > MIN_TIME);
        assert!(MAX_TIME - MIN_TIME < u32::MAX as i64);
    }
}
