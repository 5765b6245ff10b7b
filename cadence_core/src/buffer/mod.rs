//! Bounded, time-windowed FIFO buffers.
//!
//! A buffer enforces two independent bounds:
//! - capacity: at most `max_size` entries, oldest evicted first on insert;
//! - window: entries older than `window_size` seconds relative to a query's
//!   `now` are trimmed from the front before the query is answered.
//!
//! Entries are kept in arrival order. Within one source arrival order is time
//! order, which is what makes the window trim a prefix pop.

mod audio;
mod midi;

pub use audio::AudioBuffer;
pub use midi::MidiBuffer;

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::entry::Timestamped;

/// Unsynchronized window state. Owners wrap it in their own lock so extra
/// per-buffer state can be updated in the same critical section.
#[derive(Debug)]
pub(crate) struct Window<T> {
    entries: VecDeque<T>,
    max_size: usize,
    window_size: f64,
    last_timestamp: f64,
}

impl<T: Timestamped + Clone> Window<T> {
    pub(crate) fn new(max_size: usize, window_size: f64) -> Self {
        let max_size = max_size.max(1);
        Self {
            entries: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            window_size,
            last_timestamp: 0.0,
        }
    }

    pub(crate) fn push(&mut self, entry: T) {
        if self.entries.len() >= self.max_size {
            self.entries.pop_front();
        }
        self.last_timestamp = self.last_timestamp.max(entry.timestamp());
        self.entries.push_back(entry);
    }

    pub(crate) fn cleanup(&mut self, now: f64) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.entries.front() {
            if now - front.timestamp() > self.window_size {
                self.entries.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }

    pub(crate) fn recent(&mut self, duration: f64, now: f64) -> Vec<T> {
        self.cleanup(now);
        self.entries
            .iter()
            .filter(|entry| now - entry.timestamp() <= duration)
            .cloned()
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.last_timestamp = 0.0;
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn last_timestamp(&self) -> f64 {
        self.last_timestamp
    }
}

/// Thread-safe bounded FIFO of timestamped entries.
#[derive(Debug)]
pub struct TimedBuffer<T> {
    inner: Mutex<Window<T>>,
    max_size: usize,
    window_size: f64,
}

impl<T: Timestamped + Clone> TimedBuffer<T> {
    /// `max_size` is clamped to at least 1.
    pub fn new(max_size: usize, window_size: f64) -> Self {
        let inner = Window::new(max_size, window_size);
        Self {
            max_size: inner.max_size,
            window_size,
            inner: Mutex::new(inner),
        }
    }

    /// Append an entry, evicting the oldest one when full.
    pub fn add(&self, entry: T) {
        self.inner.lock().push(entry);
    }

    /// Entries with `now - timestamp <= duration`, in arrival order.
    ///
    /// Trims everything outside the retention window first.
    pub fn get_recent(&self, duration: f64, now: f64) -> Vec<T> {
        self.inner.lock().recent(duration, now)
    }

    /// Drop entries older than the retention window. Returns how many were dropped.
    pub fn cleanup(&self, now: f64) -> usize {
        self.inner.lock().cleanup(now)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest timestamp ever admitted (0.0 before the first entry).
    pub fn last_timestamp(&self) -> f64 {
        self.inner.lock().last_timestamp()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn window_size(&self) -> f64 {
        self.window_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::AudioChunk;

    fn chunk(ts: f64) -> AudioChunk {
        AudioChunk::new(vec![0.0; 4], 22050, ts)
    }

    fn stamps(chunks: &[AudioChunk]) -> Vec<f64> {
        chunks.iter().map(|c| c.timestamp).collect()
    }

    #[test]
    fn test_capacity_keeps_most_recent() {
        let buffer = TimedBuffer::new(3, 100.0);
        for i in 0..5 {
            buffer.add(chunk(i as f64));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(stamps(&buffer.get_recent(100.0, 5.0)), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let buffer = TimedBuffer::new(0, 1.0);
        assert_eq!(buffer.capacity(), 1);
        buffer.add(chunk(0.0));
        buffer.add(chunk(0.1));
        assert_eq!(stamps(&buffer.get_recent(1.0, 0.1)), vec![0.1]);
    }

    #[test]
    fn test_window_trimming() {
        let buffer = TimedBuffer::new(100, 1.0);
        buffer.add(chunk(0.0));
        buffer.add(chunk(0.5));

        // Duration larger than window still cannot see trimmed entries
        assert_eq!(stamps(&buffer.get_recent(10.0, 1.2)), vec![0.5]);
        assert_eq!(buffer.len(), 1);
        assert!(buffer.get_recent(10.0, 1.6).is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_duration_filter() {
        let buffer = TimedBuffer::new(100, 1.0);
        for ts in [0.0, 0.2, 0.4] {
            buffer.add(chunk(ts));
        }
        assert_eq!(stamps(&buffer.get_recent(0.3, 0.5)), vec![0.2, 0.4]);
        // Filtering does not remove anything inside the window
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_last_timestamp_is_max() {
        let buffer = TimedBuffer::new(10, 10.0);
        buffer.add(chunk(2.0));
        buffer.add(chunk(1.0));
        assert_eq!(buffer.last_timestamp(), 2.0);
        // Late entry is still stored
        assert_eq!(buffer.len(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.last_timestamp(), 0.0);
    }

    #[test]
    fn test_cleanup_reports_evictions() {
        let buffer = TimedBuffer::new(10, 0.5);
        for ts in [0.0, 0.1, 0.9] {
            buffer.add(chunk(ts));
        }
        assert_eq!(buffer.cleanup(1.0), 2);
        assert_eq!(buffer.cleanup(1.0), 0);
    }
}
