use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use quanta::{Clock, Instant as QuantaInstant};

/// Point-in-time copy of [`TaskStats`].
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub panicked: u64,
    /// Submitted but not yet picked up by a worker.
    pub queue_length: u64,
    pub min_task_nanos: Option<u64>,
    pub max_task_nanos: Option<u64>,
    /// Exponential moving average of task run time.
    pub ema_task_nanos: f64,
}

impl TaskStatsSnapshot {
    pub fn processing_time_secs(&self) -> f64 {
        self.ema_task_nanos / 1_000_000_000.0
    }
}

/// Lock-free task counters and run-time statistics.
///
/// Shared between the pool (which records) and the performance monitor (which
/// reads `queue_length` and the average task time into each sample). All
/// recording methods are plain atomics and safe to call from any worker.
pub struct TaskStats {
    clock: Clock,

    submitted: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,

    min_task_nanos: AtomicU64,
    max_task_nanos: AtomicU64,
    /// EMA of task duration stored as f64 bits
    ema_task_bits: AtomicU64,
    ema_alpha: f64,
}

impl TaskStats {
    /// `ema_alpha` in (0, 1]; values around 0.05..0.2 smooth well.
    pub fn new(ema_alpha: f64) -> Self {
        let ema_alpha = if ema_alpha > 0.0 && ema_alpha <= 1.0 {
            ema_alpha
        } else {
            0.1
        };
        Self {
            clock: Clock::new(),
            submitted: AtomicU64::new(0),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            min_task_nanos: AtomicU64::new(u64::MAX),
            max_task_nanos: AtomicU64::new(0),
            ema_task_bits: AtomicU64::new(0u64),
            ema_alpha,
        }
    }

    #[inline]
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo a `record_submitted` whose task never reached a worker.
    #[inline]
    pub fn retract_submitted(&self) {
        let _ = self
            .submitted
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    #[inline]
    pub fn record_panicked(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a task as picked up; the returned guard records its run time and
    /// completion on drop.
    #[inline]
    pub fn start_task(&self) -> TaskTimer<'_> {
        self.started.fetch_add(1, Ordering::Relaxed);
        TaskTimer {
            stats: self,
            start: self.clock.now(),
        }
    }

    pub fn record_task_duration(&self, d: Duration) {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        self.record_task_nanos(nanos);
    }

    /// Updates min, max and EMA.
    pub fn record_task_nanos(&self, nanos: u64) {
        self.min_task_nanos.fetch_min(nanos, Ordering::Relaxed);
        self.max_task_nanos.fetch_max(nanos, Ordering::Relaxed);

        // EMA_new = alpha * x + (1 - alpha) * EMA_old, seeded by the first sample
        let alpha = self.ema_alpha;
        let mut old_bits = self.ema_task_bits.load(Ordering::Relaxed);
        loop {
            let old = f64::from_bits(old_bits);
            let new = if old_bits == 0 {
                nanos as f64
            } else {
                alpha * (nanos as f64) + (1.0 - alpha) * old
            };
            match self.ema_task_bits.compare_exchange_weak(
                old_bits,
                new.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(found) => old_bits = found,
            }
        }
    }

    pub fn queue_length(&self) -> u64 {
        let submitted = self.submitted.load(Ordering::Relaxed);
        let started = self.started.load(Ordering::Relaxed);
        submitted.saturating_sub(started)
    }

    /// Average task run time in seconds (EMA).
    pub fn processing_time_secs(&self) -> f64 {
        f64::from_bits(self.ema_task_bits.load(Ordering::Relaxed)) / 1_000_000_000.0
    }

    pub fn snapshot(&self) -> TaskStatsSnapshot {
        let min_raw = self.min_task_nanos.load(Ordering::Relaxed);
        let max_raw = self.max_task_nanos.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        TaskStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed,
            panicked: self.panicked.load(Ordering::Relaxed),
            queue_length: self.queue_length(),
            min_task_nanos: (min_raw != u64::MAX).then_some(min_raw),
            max_task_nanos: (min_raw != u64::MAX).then_some(max_raw),
            ema_task_nanos: f64::from_bits(self.ema_task_bits.load(Ordering::Relaxed)),
        }
    }

    /// Reset timing peaks and the EMA; counters are kept.
    pub fn reset_peaks(&self) {
        self.min_task_nanos.store(u64::MAX, Ordering::Relaxed);
        self.max_task_nanos.store(0, Ordering::Relaxed);
        self.ema_task_bits.store(0u64, Ordering::Relaxed);
    }
}

impl Default for TaskStats {
    fn default() -> Self {
        Self::new(0.1)
    }
}

/// Records the elapsed time between `start_task` and drop.
pub struct TaskTimer<'a> {
    stats: &'a TaskStats,
    start: QuantaInstant,
}

impl Drop for TaskTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.stats.clock.now().saturating_duration_since(self.start);
        self.stats.record_task_duration(elapsed);
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_length_tracks_started() {
        let stats = TaskStats::default();
        stats.record_submitted();
        stats.record_submitted();
        assert_eq!(stats.queue_length(), 2);
        {
            let _timer = stats.start_task();
            assert_eq!(stats.queue_length(), 1);
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.queue_length, 1);
        assert!(snapshot.min_task_nanos.is_some());
    }

    #[test]
    fn test_retracted_submission_not_queued() {
        let stats = TaskStats::default();
        stats.record_submitted();
        stats.retract_submitted();
        assert_eq!(stats.queue_length(), 0);
        assert_eq!(stats.snapshot().submitted, 0);

        // Never goes below zero
        stats.retract_submitted();
        assert_eq!(stats.snapshot().submitted, 0);
    }

    #[test]
    fn test_min_max_and_ema() {
        let stats = TaskStats::new(0.5);
        stats.record_task_nanos(1_000);
        stats.record_task_nanos(3_000);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.min_task_nanos, Some(1_000));
        // EMA seeded with the first sample, then halfway to the second
        assert!((snapshot.ema_task_nanos - 2_000.0).abs() < 1e-9);
        assert!((stats.processing_time_secs() - 2e-6).abs() < 1e-15);

        stats.reset_peaks();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.min_task_nanos, None);
        assert_eq!(snapshot.ema_task_nanos, 0.0);
    }

    #[test]
    fn test_invalid_alpha_falls_back() {
        let stats = TaskStats::new(0.0);
        stats.record_task_nanos(10);
        stats.record_task_nanos(20);
        assert!((stats.snapshot().ema_task_nanos - 11.0).abs() < 1e-9);
    }
}
