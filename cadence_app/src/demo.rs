//! Synthetic producers for running the pipeline without hardware.

use std::f32::consts::TAU;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cadence_core::{AudioChunk, MidiEvent, SyncManager};
use crossbeam::channel::{RecvTimeoutError, Sender, bounded};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};

pub const DEMO_AUDIO_SOURCE: &str = "demo-audio";
pub const DEMO_MIDI_SOURCE: &str = "demo-midi";

const SAMPLE_RATE: u32 = 16_000;
const TICK: Duration = Duration::from_millis(50);
const ARPEGGIO: [u8; 4] = [60, 64, 67, 72];

/// Feeds a sine tone and an arpeggio into the sync manager until stopped.
pub struct DemoFeed {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl DemoFeed {
    pub fn start(sync: Arc<SyncManager>) -> AppResult<Self> {
        sync.register_audio_source(DEMO_AUDIO_SOURCE, sync.default_capacity());
        sync.register_midi_source(DEMO_MIDI_SOURCE, sync.default_capacity());

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("demo-feed".to_string())
            .spawn(move || {
                let mut generator = Generator::default();
                loop {
                    match stop_rx.recv_timeout(TICK) {
                        Err(RecvTimeoutError::Timeout) => generator.tick(&sync),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(ticks = generator.ticks, "demo feed stopped");
            })
            .map_err(|e| AppError::Spawn("demo feed", e))?;

        info!(audio = DEMO_AUDIO_SOURCE, midi = DEMO_MIDI_SOURCE, "demo feed started");
        Ok(Self { stop_tx, handle })
    }

    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.join();
    }
}

#[derive(Default)]
struct Generator {
    ticks: u64,
    phase: f32,
    sounding: Option<u8>,
}

impl Generator {
    fn tick(&mut self, sync: &SyncManager) {
        let now = sync.now();
        let frames = SAMPLE_RATE as usize * TICK.as_millis() as usize / 1000;
        let step = TAU * 440.0 / SAMPLE_RATE as f32;
        let samples = (0..frames)
            .map(|_| {
                let sample = 0.25 * self.phase.sin();
                self.phase = (self.phase + step) % TAU;
                sample
            })
            .collect();
        sync.add_audio_chunk(DEMO_AUDIO_SOURCE, AudioChunk::new(samples, SAMPLE_RATE, now));

        // New note every 5 ticks
        if self.ticks % 5 == 0 {
            if let Some(note) = self.sounding.take() {
                sync.add_midi_event(DEMO_MIDI_SOURCE, MidiEvent::note_off(note, 0, 0, now));
            }
            let note = ARPEGGIO[(self.ticks / 5) as usize % ARPEGGIO.len()];
            sync.add_midi_event(DEMO_MIDI_SOURCE, MidiEvent::note_on(note, 96, 0, now));
            self.sounding = Some(note);
        }
        self.ticks += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::ManualClock;

    #[test]
    fn test_generator_feeds_both_sources() {
        let clock = Arc::new(ManualClock::new(1.0));
        let sync = SyncManager::new(1.0).with_clock(clock.clone());
        sync.register_audio_source(DEMO_AUDIO_SOURCE, 100);
        sync.register_midi_source(DEMO_MIDI_SOURCE, 100);

        let mut generator = Generator::default();
        for _ in 0..6 {
            generator.tick(&sync);
            clock.advance(TICK.as_secs_f64());
        }

        let snapshot = sync.get_synchronized_data(1.0);
        let audio = &snapshot.audio[DEMO_AUDIO_SOURCE];
        assert_eq!(audio.chunks.len(), 6);
        assert_eq!(audio.chunks[0].samples.len(), 800);

        let midi = &snapshot.midi[DEMO_MIDI_SOURCE];
        // on(60) at tick 0, off(60) + on(64) at tick 5
        assert_eq!(midi.events.len(), 3);
        assert_eq!(midi.active_notes.len(), 1);
        assert_eq!(midi.active_notes[0].note, Some(64));
    }
}
