//! Multi-source synchronization.
//!
//! [`SyncManager`] owns one buffer per registered source and answers windowed
//! queries across all of them with a single shared `now`.
//!
//! Lock order: the registry lock is always taken before any buffer lock, and a
//! buffer lock is never held while acquiring the registry lock. Ingestion takes
//! the registry lock for reading, so producers on different sources only
//! contend on their own buffer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::buffer::{AudioBuffer, MidiBuffer};
use crate::clock::{MonotonicClock, TimeSource};
use crate::config::SyncConfig;
use crate::entry::{AudioChunk, MidiEvent, TimedEntry, Timestamped};
use crate::error::CoreResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSourceSnapshot {
    pub chunks: Vec<AudioChunk>,
    pub latest_timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiSourceSnapshot {
    pub events: Vec<MidiEvent>,
    pub active_notes: Vec<MidiEvent>,
    pub latest_timestamp: f64,
}

/// Per-source windows taken in one query, stamped with the query time.
///
/// A source appears only if it has something to report, so presence in a map
/// means the source is currently live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub audio: BTreeMap<String, AudioSourceSnapshot>,
    pub midi: BTreeMap<String, MidiSourceSnapshot>,
    pub timestamp: f64,
}

impl SyncSnapshot {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && self.midi.is_empty()
    }

    pub fn source_count(&self) -> usize {
        self.audio.len() + self.midi.len()
    }
}

#[derive(Default)]
struct Registry {
    audio: HashMap<String, AudioBuffer>,
    midi: HashMap<String, MidiBuffer>,
    /// Kept independently of registration so a latency measured before the
    /// source registers still applies to its first entries.
    latencies: HashMap<String, f64>,
}

impl Registry {
    fn latency(&self, source_id: &str) -> f64 {
        self.latencies.get(source_id).copied().unwrap_or(0.0)
    }
}

/// Registry of audio and MIDI sources with latency-compensated ingestion.
///
/// The same id may be registered once as an audio source and once as a MIDI
/// source; both share the id's latency.
pub struct SyncManager {
    registry: RwLock<Registry>,
    window_size: f64,
    default_capacity: usize,
    clock: Arc<dyn TimeSource>,
    dropped_entries: AtomicU64,
}

impl SyncManager {
    /// Manager with a `window_size`-second retention window on the process clock.
    pub fn new(window_size: f64) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            window_size,
            default_capacity: SyncConfig::new().default_capacity,
            clock: Arc::new(MonotonicClock::new()),
            dropped_entries: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &SyncConfig) -> CoreResult<Self> {
        config.validate()?;
        let mut manager = Self::new(config.window_size_secs);
        manager.default_capacity = config.default_capacity;
        Ok(manager)
    }

    /// Replace the time source. Call before any entries are admitted.
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Current time on the manager's axis. Producers stamp entries with this.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn TimeSource> {
        Arc::clone(&self.clock)
    }

    pub fn window_size(&self) -> f64 {
        self.window_size
    }

    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    // ---------------------------
    // Registration
    // ---------------------------

    /// Returns `false` if the id was already registered as an audio source.
    pub fn register_audio_source(&self, source_id: &str, max_size: usize) -> bool {
        let mut registry = self.registry.write();
        if registry.audio.contains_key(source_id) {
            return false;
        }
        registry
            .audio
            .insert(source_id.to_string(), AudioBuffer::new(max_size, self.window_size));
        debug!(source_id, max_size, "registered audio source");
        true
    }

    /// Returns `false` if the id was already registered as a MIDI source.
    pub fn register_midi_source(&self, source_id: &str, max_size: usize) -> bool {
        let mut registry = self.registry.write();
        if registry.midi.contains_key(source_id) {
            return false;
        }
        registry
            .midi
            .insert(source_id.to_string(), MidiBuffer::new(max_size, self.window_size));
        debug!(source_id, max_size, "registered midi source");
        true
    }

    /// Drop the id's buffers and latency. Unknown ids are ignored.
    ///
    /// Returns whether anything was removed.
    pub fn remove_source(&self, source_id: &str) -> bool {
        let mut registry = self.registry.write();
        let audio = registry.audio.remove(source_id).is_some();
        let midi = registry.midi.remove(source_id).is_some();
        let latency = registry.latencies.remove(source_id).is_some();
        if audio || midi {
            debug!(source_id, audio, midi, "removed source");
        }
        audio || midi || latency
    }

    /// Set the latency subtracted from this source's future timestamps.
    ///
    /// Positive latency means the source's stamps run ahead of the common
    /// clock. Already-buffered entries are not touched.
    pub fn update_source_latency(&self, source_id: &str, latency: f64) {
        self.registry
            .write()
            .latencies
            .insert(source_id.to_string(), latency);
        debug!(source_id, latency, "updated source latency");
    }

    pub fn source_latency(&self, source_id: &str) -> Option<f64> {
        self.registry.read().latencies.get(source_id).copied()
    }

    pub fn audio_sources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.read().audio.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn midi_sources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.read().midi.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    // ---------------------------
    // Ingestion
    // ---------------------------

    /// Admit a chunk for `source_id`, shifted by the source's latency.
    ///
    /// Chunks for unregistered sources are dropped and counted; returns whether
    /// the chunk was stored.
    pub fn add_audio_chunk(&self, source_id: &str, mut chunk: AudioChunk) -> bool {
        let registry = self.registry.read();
        match registry.audio.get(source_id) {
            Some(buffer) => {
                chunk.compensate(registry.latency(source_id));
                buffer.add_chunk(chunk);
                true
            }
            None => {
                self.record_drop(source_id, "audio");
                false
            }
        }
    }

    /// Admit an event for `source_id`, shifted by the source's latency.
    ///
    /// Events for unregistered sources are dropped and counted; returns whether
    /// the event was stored.
    pub fn add_midi_event(&self, source_id: &str, mut event: MidiEvent) -> bool {
        let registry = self.registry.read();
        match registry.midi.get(source_id) {
            Some(buffer) => {
                event.compensate(registry.latency(source_id));
                buffer.add_event(event);
                true
            }
            None => {
                self.record_drop(source_id, "midi");
                false
            }
        }
    }

    pub fn ingest(&self, source_id: &str, entry: TimedEntry) -> bool {
        match entry {
            TimedEntry::Audio(chunk) => self.add_audio_chunk(source_id, chunk),
            TimedEntry::Midi(event) => self.add_midi_event(source_id, event),
        }
    }

    /// Entries dropped because their source was not registered.
    pub fn dropped_entries(&self) -> u64 {
        self.dropped_entries.load(Ordering::Relaxed)
    }

    fn record_drop(&self, source_id: &str, kind: &'static str) {
        self.dropped_entries.fetch_add(1, Ordering::Relaxed);
        trace!(source_id, kind, "dropped entry for unregistered source");
    }

    // ---------------------------
    // Queries
    // ---------------------------

    /// Everything each source produced in the last `duration` seconds.
    pub fn get_synchronized_data(&self, duration: f64) -> SyncSnapshot {
        let registry = self.registry.read();
        let now = self.clock.now();
        let mut snapshot = SyncSnapshot {
            timestamp: now,
            ..SyncSnapshot::default()
        };

        for (source_id, buffer) in &registry.audio {
            let chunks = buffer.get_recent_chunks(duration, now);
            if !chunks.is_empty() {
                snapshot.audio.insert(
                    source_id.clone(),
                    AudioSourceSnapshot {
                        chunks,
                        latest_timestamp: buffer.last_timestamp(),
                    },
                );
            }
        }

        for (source_id, buffer) in &registry.midi {
            let (events, active_notes, latest_timestamp) = buffer.snapshot(duration, now);
            if !events.is_empty() || !active_notes.is_empty() {
                snapshot.midi.insert(
                    source_id.clone(),
                    MidiSourceSnapshot {
                        events,
                        active_notes,
                        latest_timestamp,
                    },
                );
            }
        }

        snapshot
    }

    /// `reference_time` minus the source's latest timestamp.
    ///
    /// 0.0 if the source is unknown or has no buffered entries. Audio takes
    /// precedence when the id is registered as both kinds.
    pub fn estimate_sync_offset(&self, source_id: &str, reference_time: f64) -> f64 {
        let registry = self.registry.read();
        let last = if let Some(buffer) = registry.audio.get(source_id) {
            (!buffer.is_empty()).then(|| buffer.last_timestamp())
        } else if let Some(buffer) = registry.midi.get(source_id) {
            (!buffer.is_empty()).then(|| buffer.last_timestamp())
        } else {
            None
        };
        last.map_or(0.0, |ts| reference_time - ts)
    }
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new(SyncConfig::new().window_size_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;

    fn manager_at(start: f64) -> (SyncManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let manager = SyncManager::new(1.0).with_clock(clock.clone());
        (manager, clock)
    }

    fn chunk(ts: f64) -> AudioChunk {
        AudioChunk::new(vec![0.0; 8], 22050, ts)
    }

    #[test]
    fn test_recent_audio_window() {
        let (manager, clock) = manager_at(0.0);
        manager.register_audio_source("mic1", 100);
        for ts in [0.0, 0.2, 0.4] {
            manager.add_audio_chunk("mic1", chunk(ts));
        }
        clock.set(0.5);

        let snapshot = manager.get_synchronized_data(0.3);
        let mic = &snapshot.audio["mic1"];
        let stamps: Vec<f64> = mic.chunks.iter().map(|c| c.timestamp).collect();
        assert_eq!(stamps, vec![0.2, 0.4]);
        assert_eq!(mic.latest_timestamp, 0.4);
        assert_eq!(snapshot.timestamp, 0.5);
    }

    #[test]
    fn test_midi_active_notes_in_snapshot() {
        let (manager, clock) = manager_at(1.0);
        manager.register_midi_source("synth", 100);

        manager.add_midi_event("synth", MidiEvent::note_on(60, 100, 0, 1.0));
        let notes = &manager.get_synchronized_data(0.1).midi["synth"].active_notes;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].note, Some(60));

        clock.set(1.5);
        manager.add_midi_event("synth", MidiEvent::note_off(60, 0, 0, 1.5));
        let synth = &manager.get_synchronized_data(0.1).midi["synth"];
        assert!(synth.active_notes.is_empty());
        assert_eq!(synth.events.len(), 1);

        // Nothing recent and nothing held: source is omitted
        clock.set(3.0);
        assert!(manager.get_synchronized_data(0.1).midi.is_empty());
    }

    #[test]
    fn test_held_note_keeps_source_live() {
        let (manager, clock) = manager_at(0.0);
        manager.register_midi_source("pad", 100);
        manager.add_midi_event("pad", MidiEvent::note_on(36, 90, 9, 0.0));
        clock.set(10.0);

        let snapshot = manager.get_synchronized_data(0.1);
        let pad = &snapshot.midi["pad"];
        assert!(pad.events.is_empty());
        assert_eq!(pad.active_notes.len(), 1);
    }

    #[test]
    fn test_latency_compensation() {
        let (manager, clock) = manager_at(5.0);
        manager.register_audio_source("remote", 100);
        manager.update_source_latency("remote", 0.25);
        manager.add_audio_chunk("remote", chunk(5.0));

        let snapshot = manager.get_synchronized_data(1.0);
        assert_eq!(snapshot.audio["remote"].chunks[0].timestamp, 4.75);
        assert_eq!(snapshot.audio["remote"].latest_timestamp, 4.75);

        // No retroactive shift
        manager.update_source_latency("remote", 0.5);
        clock.set(5.1);
        let chunks = &manager.get_synchronized_data(1.0).audio["remote"].chunks;
        assert_eq!(chunks[0].timestamp, 4.75);
    }

    #[test]
    fn test_latency_set_before_registration() {
        let (manager, _clock) = manager_at(2.0);
        manager.update_source_latency("late", 0.5);
        manager.register_midi_source("late", 10);
        manager.add_midi_event("late", MidiEvent::control_change(1, 1, 0, 2.0));

        let events = &manager.get_synchronized_data(1.0).midi["late"].events;
        assert_eq!(events[0].timestamp, 1.5);
        assert_eq!(manager.source_latency("late"), Some(0.5));
    }

    #[test]
    fn test_unregistered_source_is_dropped() {
        let (manager, _clock) = manager_at(0.0);
        assert!(!manager.add_audio_chunk("ghost", chunk(0.0)));
        assert!(!manager.add_midi_event("ghost", MidiEvent::note_on(60, 1, 0, 0.0)));

        let snapshot = manager.get_synchronized_data(1.0);
        assert!(snapshot.is_empty());
        assert!(manager.audio_sources().is_empty());
        assert_eq!(manager.dropped_entries(), 2);
    }

    #[test]
    fn test_registration_is_idempotent() {
        let (manager, _clock) = manager_at(0.0);
        assert!(manager.register_audio_source("mic", 10));
        manager.add_audio_chunk("mic", chunk(0.0));
        assert!(!manager.register_audio_source("mic", 500));

        // Existing buffer kept, with its contents
        assert_eq!(manager.get_synchronized_data(1.0).audio["mic"].chunks.len(), 1);
    }

    #[test]
    fn test_remove_source() {
        let (manager, _clock) = manager_at(0.0);
        manager.register_audio_source("sid", 10);
        manager.register_midi_source("sid", 10);
        manager.update_source_latency("sid", 0.1);
        assert_eq!(manager.audio_sources(), vec!["sid".to_string()]);
        assert_eq!(manager.midi_sources(), vec!["sid".to_string()]);

        assert!(manager.remove_source("sid"));
        assert!(manager.audio_sources().is_empty());
        assert!(manager.midi_sources().is_empty());
        assert_eq!(manager.source_latency("sid"), None);
        assert!(!manager.remove_source("sid"));
        assert!(!manager.remove_source("never-registered"));
    }

    #[test]
    fn test_ingest_dispatches_by_kind() {
        let (manager, _clock) = manager_at(0.0);
        manager.register_audio_source("a", 10);
        manager.register_midi_source("m", 10);

        assert!(manager.ingest("a", chunk(0.0).into()));
        assert!(manager.ingest("m", MidiEvent::note_on(1, 1, 0, 0.0).into()));
        // Kind mismatch counts as unregistered
        assert!(!manager.ingest("a", MidiEvent::note_on(1, 1, 0, 0.0).into()));

        let snapshot = manager.get_synchronized_data(1.0);
        assert_eq!(snapshot.source_count(), 2);
    }

    #[test]
    fn test_estimate_sync_offset() {
        let (manager, _clock) = manager_at(0.0);
        manager.register_audio_source("mic", 10);
        assert_eq!(manager.estimate_sync_offset("mic", 3.0), 0.0);
        assert_eq!(manager.estimate_sync_offset("unknown", 3.0), 0.0);

        manager.add_audio_chunk("mic", chunk(2.5));
        assert_eq!(manager.estimate_sync_offset("mic", 3.0), 0.5);

        manager.register_midi_source("keys", 10);
        manager.add_midi_event("keys", MidiEvent::note_on(60, 1, 0, 1.0));
        assert_eq!(manager.estimate_sync_offset("keys", 3.0), 2.0);
    }

    #[test]
    fn test_from_config() {
        let config = SyncConfig::new().with_window_size(2.0).with_default_capacity(64);
        let manager = SyncManager::from_config(&config).unwrap();
        assert_eq!(manager.window_size(), 2.0);
        assert_eq!(manager.default_capacity(), 64);
        assert!(SyncManager::from_config(&config.with_window_size(-1.0)).is_err());
    }

    #[test]
    fn test_snapshot_serializes() {
        let (manager, _clock) = manager_at(0.0);
        manager.register_midi_source("synth", 10);
        manager.add_midi_event("synth", MidiEvent::note_on(60, 100, 0, 0.0));

        let json = serde_json::to_value(manager.get_synchronized_data(0.1)).unwrap();
        assert_eq!(json["midi"]["synth"]["active_notes"][0]["note"], 60);
        assert!(json["audio"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_producers_and_poller() {
        let manager = Arc::new(SyncManager::new(60.0));
        for i in 0..4 {
            manager.register_midi_source(&format!("keys{i}"), 64);
        }

        let producers: Vec<_> = (0..4)
            .map(|i| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    let id = format!("keys{i}");
                    for n in 0..500u32 {
                        let note = ((n / 2) % 12) as u8 + 48;
                        let ts = manager.now();
                        let event = if n % 2 == 0 {
                            MidiEvent::note_on(note, 100, 0, ts)
                        } else {
                            MidiEvent::note_off(note, 0, 0, ts)
                        };
                        manager.add_midi_event(&id, event);
                    }
                })
            })
            .collect();

        let poller = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = manager.get_synchronized_data(60.0);
                    for source in snapshot.midi.values() {
                        let mut notes: Vec<u8> =
                            source.active_notes.iter().filter_map(|e| e.note).collect();
                        let before = notes.len();
                        notes.dedup();
                        assert_eq!(before, notes.len());
                        assert!(source.events.len() <= 64);
                    }
                }
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        poller.join().unwrap();

        // Every note-on was followed by its note-off
        let snapshot = manager.get_synchronized_data(60.0);
        for source in snapshot.midi.values() {
            assert!(source.active_notes.is_empty());
            assert_eq!(source.events.len(), 64);
        }
    }
}
