use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::entry::MidiEvent;

use super::Window;

#[derive(Debug)]
struct MidiState {
    window: Window<MidiEvent>,
    /// note number -> latest unmatched note-on
    active_notes: BTreeMap<u8, MidiEvent>,
}

/// Windowed buffer of MIDI events for one source, plus the set of notes
/// currently sounding on it.
///
/// The event FIFO and the active-note map share one lock, so a reader never
/// sees an event in the FIFO that the note map has not yet applied.
/// Active notes are not subject to the retention window: a held note stays
/// active until its note-off arrives.
#[derive(Debug)]
pub struct MidiBuffer {
    inner: Mutex<MidiState>,
    max_size: usize,
    window_size: f64,
}

impl MidiBuffer {
    pub fn new(max_size: usize, window_size: f64) -> Self {
        let window = Window::new(max_size, window_size);
        Self {
            max_size: window.max_size,
            window_size,
            inner: Mutex::new(MidiState {
                window,
                active_notes: BTreeMap::new(),
            }),
        }
    }

    pub fn add_event(&self, event: MidiEvent) {
        let mut state = self.inner.lock();
        if let Some(note) = event.note {
            if event.is_note_off() {
                state.active_notes.remove(&note);
            } else if event.is_note_on() {
                state.active_notes.insert(note, event.clone());
            }
        }
        state.window.push(event);
    }

    pub fn get_recent_events(&self, duration: f64, now: f64) -> Vec<MidiEvent> {
        self.inner.lock().window.recent(duration, now)
    }

    /// Copy of the currently sounding notes, ordered by note number.
    pub fn get_active_notes(&self) -> Vec<MidiEvent> {
        self.inner.lock().active_notes.values().cloned().collect()
    }

    /// Recent events and active notes read under a single lock acquisition.
    pub fn snapshot(&self, duration: f64, now: f64) -> (Vec<MidiEvent>, Vec<MidiEvent>, f64) {
        let mut state = self.inner.lock();
        let events = state.window.recent(duration, now);
        let active = state.active_notes.values().cloned().collect();
        (events, active, state.window.last_timestamp())
    }

    pub fn is_note_active(&self, note: u8) -> bool {
        self.inner.lock().active_notes.contains_key(&note)
    }

    pub fn cleanup(&self, now: f64) -> usize {
        self.inner.lock().window.cleanup(now)
    }

    /// Drop all events and forget every active note.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.window.clear();
        state.active_notes.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_timestamp(&self) -> f64 {
        self.inner.lock().window.last_timestamp()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn window_size(&self) -> f64 {
        self.window_size
    }
}
