//! Time utilities for cocalc-plus
//!
//! Caches and registry timestamps read time through [`Clock`] so tests can
//! drive TTL expiry deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        current_time_millis()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Get the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is set before the Unix epoch.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Calculate elapsed time in milliseconds since a given timestamp.
///
/// Returns 0 if the given time is in the future.
pub fn elapsed_millis(clock: &dyn Clock, since: u64) -> u64 {
    clock.now_millis().saturating_sub(since)
}

/// Human-readable age of a millisecond timestamp ("12s ago", "3h ago")
pub fn format_age(clock: &dyn Clock, since: u64) -> String {
    let secs = elapsed_millis(clock, since) / 1000;
    if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_time_millis_is_positive() {
        assert!(current_time_millis() > 0);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1_250);
        clock.set(5);
        assert_eq!(clock.now_millis(), 5);
    }

    #[test]
    fn test_elapsed_millis_future_time() {
        let clock = ManualClock::new(1_000);
        assert_eq!(elapsed_millis(&clock, 5_000), 0);
        assert_eq!(elapsed_millis(&clock, 400), 600);
    }

    #[test]
    fn test_format_age() {
        let clock = ManualClock::new(10 * 86_400_000);
        assert_eq!(format_age(&clock, clock.now_millis() - 5_000), "5s ago");
        assert_eq!(format_age(&clock, clock.now_millis() - 120_000), "2m ago");
        assert_eq!(format_age(&clock, clock.now_millis() - 7_200_000), "2h ago");
        assert_eq!(format_age(&clock, 0), "10d ago");
    }
}
