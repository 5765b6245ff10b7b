//! Time sources for stamping and windowing entries.
//!
//! All timestamps in this crate are `f64` seconds on a single monotonic axis.
//! Producers that stamp their own entries should read the same clock the
//! [`SyncManager`](crate::sync::SyncManager) queries with, otherwise window
//! arithmetic compares unrelated axes.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use quanta::{Clock, Instant as QuantaInstant};

/// Anything that can report "now" in seconds on a monotonic axis.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> f64;
}

static EPOCH: OnceLock<(Clock, QuantaInstant)> = OnceLock::new();

fn epoch() -> &'static (Clock, QuantaInstant) {
    EPOCH.get_or_init(|| {
        let clock = Clock::new();
        let start = clock.now();
        (clock, start)
    })
}

/// High-resolution monotonic clock measured from a process-wide epoch.
///
/// Every instance shares the same epoch, so values from different instances
/// are directly comparable.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> f64 {
        let (clock, start) = epoch();
        clock.now().duration_since(*start).as_secs_f64()
    }
}

/// Settable clock for deterministic tests and offline replays.
///
/// The current time is stored as f64 bits in an `AtomicU64`, so it can be
/// advanced from one thread while others read it.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::Relaxed);
    }

    pub fn advance(&self, secs: f64) {
        let mut old_bits = self.bits.load(Ordering::Relaxed);
        loop {
            let new_bits = (f64::from_bits(old_bits) + secs).to_bits();
            match self.bits.compare_exchange_weak(
                old_bits,
                new_bits,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(found) => old_bits = found,
            }
        }
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = MonotonicClock::new().now();
        assert!(a >= 0.0);
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_set_and_advance() {
        let clock = ManualClock::new(1.0);
        assert_eq!(clock.now(), 1.0);
        clock.advance(0.5);
        assert!((clock.now() - 1.5).abs() < 1e-12);
        clock.set(10.0);
        assert_eq!(clock.now(), 10.0);
    }
}
