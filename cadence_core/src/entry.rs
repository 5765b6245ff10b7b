//! Timestamped values admitted into the sync buffers.
//!
//! Two payload kinds exist, [`AudioChunk`] and [`MidiEvent`]. Code that accepts
//! either takes a [`TimedEntry`] and matches on it; nothing downstream inspects
//! payload shape at runtime.

use std::collections::BTreeMap;

use dasp::Sample;
use serde::{Deserialize, Serialize};

use crate::error::{MidiParseError, PcmError};

/// Free-form per-entry annotations carried through untouched.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Access to the timestamp every buffered value carries.
pub trait Timestamped {
    /// Seconds on the manager's monotonic axis.
    fn timestamp(&self) -> f64;

    fn set_timestamp(&mut self, timestamp: f64);

    /// Shift the timestamp back by `offset` seconds (latency compensation).
    #[inline]
    fn compensate(&mut self, offset: f64) {
        let ts = self.timestamp();
        self.set_timestamp(ts - offset);
    }
}

/// A block of mono audio samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub timestamp: f64,
    #[serde(default)]
    pub is_speech: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32, timestamp: f64) -> Self {
        Self {
            samples,
            sample_rate,
            timestamp,
            is_speech: false,
            metadata: None,
        }
    }

    /// Decode little-endian signed 16-bit PCM into a chunk.
    ///
    /// Samples are scaled into `[-1.0, 1.0)`.
    pub fn from_pcm16_le(bytes: &[u8], sample_rate: u32, timestamp: f64) -> Result<Self, PcmError> {
        if bytes.len() % 2 != 0 {
            return Err(PcmError::OddLength(bytes.len()));
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]).to_sample::<f32>())
            .collect();
        Ok(Self::new(samples, sample_rate, timestamp))
    }

    pub fn with_speech(mut self, is_speech: bool) -> Self {
        self.is_speech = is_speech;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Duration covered by the samples, in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

impl Timestamped for AudioChunk {
    #[inline]
    fn timestamp(&self) -> f64 {
        self.timestamp
    }

    #[inline]
    fn set_timestamp(&mut self, timestamp: f64) {
        self.timestamp = timestamp;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MidiEventKind {
    NoteOn,
    NoteOff,
    ControlChange,
}

/// A decoded MIDI channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub kind: MidiEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<u8>,
    #[serde(default)]
    pub channel: u8,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl MidiEvent {
    pub fn note_on(note: u8, velocity: u8, channel: u8, timestamp: f64) -> Self {
        Self {
            kind: MidiEventKind::NoteOn,
            note: Some(note),
            velocity: Some(velocity),
            channel,
            timestamp,
            controller: None,
            value: None,
            metadata: None,
        }
    }

    pub fn note_off(note: u8, velocity: u8, channel: u8, timestamp: f64) -> Self {
        Self {
            kind: MidiEventKind::NoteOff,
            ..Self::note_on(note, velocity, channel, timestamp)
        }
    }

    pub fn control_change(controller: u8, value: u8, channel: u8, timestamp: f64) -> Self {
        Self {
            kind: MidiEventKind::ControlChange,
            note: None,
            velocity: None,
            channel,
            timestamp,
            controller: Some(controller),
            value: Some(value),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Decode a raw channel message.
    ///
    /// Returns `Ok(None)` for status bytes that are not note-on, note-off or
    /// control-change. A note-on with velocity 0 decodes as a note-off.
    pub fn from_bytes(data: &[u8], timestamp: f64) -> Result<Option<Self>, MidiParseError> {
        let status = *data.first().ok_or(MidiParseError::Empty)?;
        let channel = status & 0x0F;
        let message_type = status & 0xF0;

        if !matches!(message_type, 0x80 | 0x90 | 0xB0) {
            return Ok(None);
        }
        if data.len() < 3 {
            return Err(MidiParseError::Truncated {
                status,
                len: data.len(),
            });
        }

        let (d1, d2) = (data[1] & 0x7F, data[2] & 0x7F);
        let event = match message_type {
            0x90 if d2 > 0 => Self::note_on(d1, d2, channel, timestamp),
            0x90 | 0x80 => Self::note_off(d1, d2, channel, timestamp),
            _ => Self::control_change(d1, d2, channel, timestamp),
        };
        Ok(Some(event))
    }

    pub fn is_note_on(&self) -> bool {
        self.kind == MidiEventKind::NoteOn && self.velocity != Some(0)
    }

    /// Note-off, or a note-on with zero velocity.
    pub fn is_note_off(&self) -> bool {
        match self.kind {
            MidiEventKind::NoteOff => true,
            MidiEventKind::NoteOn => self.velocity == Some(0),
            MidiEventKind::ControlChange => false,
        }
    }
}

impl Timestamped for MidiEvent {
    #[inline]
    fn timestamp(&self) -> f64 {
        self.timestamp
    }

    #[inline]
    fn set_timestamp(&mut self, timestamp: f64) {
        self.timestamp = timestamp;
    }
}

/// Either payload kind, resolved at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimedEntry {
    Audio(AudioChunk),
    Midi(MidiEvent),
}

impl Timestamped for TimedEntry {
    fn timestamp(&self) -> f64 {
        match self {
            Self::Audio(chunk) => chunk.timestamp,
            Self::Midi(event) => event.timestamp,
        }
    }

    fn set_timestamp(&mut self, timestamp: f64) {
        match self {
            Self::Audio(chunk) => chunk.timestamp = timestamp,
            Self::Midi(event) => event.timestamp = timestamp,
        }
    }
}

impl From<AudioChunk> for TimedEntry {
    fn from(chunk: AudioChunk) -> Self {
        Self::Audio(chunk)
    }
}

impl From<MidiEvent> for TimedEntry {
    fn from(event: MidiEvent) -> Self {
        Self::Midi(event)
    }
}
