//! Replays recorded audio (WAV) and MIDI (SMF) files into a [`SyncManager`].
//!
//! A file is first turned into a [`ReplaySchedule`]: entries with their offset
//! in seconds from the start of the recording. [`FileReplay`] then feeds the
//! schedule through [`SyncManager::ingest`] on its own thread, stamping each
//! entry with the replay start time plus its offset, so recorded sources take
//! the same ingestion path as live ones.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cadence_core::{AudioChunk, MidiEvent, SyncManager, TimedEntry, Timestamped};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tempo assumed until the first tempo meta event (120 BPM).
const DEFAULT_MICROS_PER_BEAT: u32 = 500_000;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode WAV: {0}")]
    Wav(#[from] hound::Error),

    #[error("Failed to parse MIDI file: {0}")]
    Midi(#[from] midly::Error),

    #[error("Failed to spawn replay thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Recorded entries ordered by offset from the start of the recording.
#[derive(Debug, Clone, Default)]
pub struct ReplaySchedule {
    entries: Vec<(f64, TimedEntry)>,
}

impl ReplaySchedule {
    /// Split mono `samples` into chunks of `chunk_frames`.
    pub fn from_audio(samples: &[f32], sample_rate: u32, chunk_frames: usize) -> Self {
        let chunk_frames = chunk_frames.max(1);
        let rate = f64::from(sample_rate.max(1));
        let entries = samples
            .chunks(chunk_frames)
            .enumerate()
            .map(|(i, frames)| {
                let offset = (i * chunk_frames) as f64 / rate;
                let chunk = AudioChunk::new(frames.to_vec(), sample_rate, offset);
                (offset, TimedEntry::Audio(chunk))
            })
            .collect();
        Self { entries }
    }

    pub fn from_wav_file(path: impl AsRef<Path>, chunk_frames: usize) -> Result<Self, ReplayError> {
        let reader = hound::WavReader::open(path)?;
        Self::from_wav_reader(reader, chunk_frames)
    }

    /// Decode any WAV stream, downmixing to mono.
    pub fn from_wav_reader<R: Read>(reader: hound::WavReader<R>, chunk_frames: usize) -> Result<Self, ReplayError> {
        let spec = reader.spec();
        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<f32>, hound::Error>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<f32>, hound::Error>>()?
            }
        };

        let channels = usize::from(spec.channels.max(1));
        let mono: Vec<f32> = interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        debug!(
            sample_rate = spec.sample_rate,
            channels,
            frames = mono.len(),
            "decoded WAV for replay"
        );
        Ok(Self::from_audio(&mono, spec.sample_rate, chunk_frames))
    }

    pub fn from_midi_file(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let bytes = std::fs::read(path)?;
        Self::from_smf_bytes(&bytes)
    }

    /// Note-on, note-off and control-change events of every track, merged
    /// and timed through the file's tempo map.
    pub fn from_smf_bytes(bytes: &[u8]) -> Result<Self, ReplayError> {
        let smf = Smf::parse(bytes)?;

        // (absolute tick, track-local order, kind)
        let mut timeline: Vec<(u64, usize, TrackEventKind<'_>)> = Vec::new();
        for track in &smf.tracks {
            let mut tick = 0u64;
            for event in track {
                tick += u64::from(event.delta.as_int());
                timeline.push((tick, timeline.len(), event.kind));
            }
        }
        timeline.sort_by_key(|&(tick, order, _)| (tick, order));

        let mut clock = TickClock::new(smf.header.timing);
        let mut entries = Vec::new();
        for (tick, _, kind) in timeline {
            let offset = clock.seconds_at(tick);
            match kind {
                TrackEventKind::Meta(MetaMessage::Tempo(micros)) => clock.set_tempo(tick, micros.as_int()),
                TrackEventKind::Midi { channel, message } => {
                    if let Some(event) = convert_message(message, channel.as_int(), offset) {
                        entries.push((offset, TimedEntry::Midi(event)));
                    }
                }
                _ => {}
            }
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset of the last entry, in seconds.
    pub fn duration(&self) -> f64 {
        self.entries.last().map_or(0.0, |(offset, _)| *offset)
    }

    pub fn has_audio(&self) -> bool {
        self.entries.iter().any(|(_, e)| matches!(e, TimedEntry::Audio(_)))
    }

    pub fn has_midi(&self) -> bool {
        self.entries.iter().any(|(_, e)| matches!(e, TimedEntry::Midi(_)))
    }

    pub fn entries(&self) -> &[(f64, TimedEntry)] {
        &self.entries
    }
}

fn convert_message(message: MidiMessage, channel: u8, offset: f64) -> Option<MidiEvent> {
    match message {
        MidiMessage::NoteOn { key, vel } if vel.as_int() == 0 => {
            Some(MidiEvent::note_off(key.as_int(), 0, channel, offset))
        }
        MidiMessage::NoteOn { key, vel } => Some(MidiEvent::note_on(key.as_int(), vel.as_int(), channel, offset)),
        MidiMessage::NoteOff { key, vel } => Some(MidiEvent::note_off(key.as_int(), vel.as_int(), channel, offset)),
        MidiMessage::Controller { controller, value } => Some(MidiEvent::control_change(
            controller.as_int(),
            value.as_int(),
            channel,
            offset,
        )),
        _ => None,
    }
}

/// Converts absolute ticks to seconds across tempo changes.
struct TickClock {
    timing: Timing,
    micros_per_beat: u32,
    /// Tick and time of the last tempo change.
    anchor_tick: u64,
    anchor_secs: f64,
}

impl TickClock {
    fn new(timing: Timing) -> Self {
        Self {
            timing,
            micros_per_beat: DEFAULT_MICROS_PER_BEAT,
            anchor_tick: 0,
            anchor_secs: 0.0,
        }
    }

    /// Ticks per second under the current tempo.
    fn tick_rate(&self) -> f64 {
        match self.timing {
            Timing::Metrical(ticks_per_beat) => {
                f64::from(ticks_per_beat.as_int().max(1)) * 1_000_000.0 / f64::from(self.micros_per_beat)
            }
            Timing::Timecode(fps, subframes) => f64::from(fps.as_f32()) * f64::from(subframes.max(1)),
        }
    }

    fn seconds_at(&self, tick: u64) -> f64 {
        self.anchor_secs + tick.saturating_sub(self.anchor_tick) as f64 / self.tick_rate()
    }

    fn set_tempo(&mut self, tick: u64, micros_per_beat: u32) {
        self.anchor_secs = self.seconds_at(tick);
        self.anchor_tick = tick;
        self.micros_per_beat = micros_per_beat.max(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Emit each entry when its offset has elapsed.
    RealTime,
    /// Emit everything as fast as possible.
    Immediate,
}

/// Feeds a [`ReplaySchedule`] into one source of a [`SyncManager`].
pub struct FileReplay {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
    emitted: Arc<AtomicU64>,
    source_id: String,
}

impl FileReplay {
    /// Register `source_id` for whichever kinds the schedule holds and start
    /// replaying it.
    pub fn start(
        sync: Arc<SyncManager>,
        source_id: &str,
        schedule: ReplaySchedule,
        pacing: Pacing,
    ) -> Result<Self, ReplayError> {
        if schedule.has_audio() {
            sync.register_audio_source(source_id, sync.default_capacity());
        }
        if schedule.has_midi() {
            sync.register_midi_source(source_id, sync.default_capacity());
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let emitted = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&emitted);
        let id = source_id.to_string();
        let total = schedule.len();

        let handle = thread::Builder::new()
            .name(format!("replay-{source_id}"))
            .spawn(move || {
                let started_wall = Instant::now();
                let started_at = sync.now();
                for (offset, mut entry) in schedule.entries {
                    if pacing == Pacing::RealTime {
                        let due = Duration::from_secs_f64(offset.max(0.0));
                        let wait = due.saturating_sub(started_wall.elapsed());
                        match stop_rx.recv_timeout(wait) {
                            Err(RecvTimeoutError::Timeout) => {}
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        }
                    } else if stop_rx.try_recv().is_ok() {
                        break;
                    }

                    entry.set_timestamp(started_at + offset);
                    if sync.ingest(&id, entry) {
                        counter.fetch_add(1, Ordering::Relaxed);
                    } else {
                        warn!(source = %id, "replay source no longer registered, stopping");
                        break;
                    }
                }
                debug!(source = %id, emitted = counter.load(Ordering::Relaxed), "replay finished");
            })
            .map_err(ReplayError::Spawn)?;

        info!(source = source_id, entries = total, ?pacing, "replay started");
        Ok(Self {
            stop_tx,
            handle,
            emitted,
            source_id: source_id.to_string(),
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Entries ingested so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the whole schedule has been fed; returns the entry count.
    pub fn wait(self) -> u64 {
        if self.handle.join().is_err() {
            warn!(source = %self.source_id, "replay thread panicked");
        }
        self.emitted.load(Ordering::Relaxed)
    }

    /// Abandon the rest of the schedule.
    pub fn stop(self) -> u64 {
        let _ = self.stop_tx.send(());
        self.wait()
    }
}
