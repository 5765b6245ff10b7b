//! Time-windowed buffering and cross-source alignment for live audio and MIDI.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod sync;

pub use buffer::{AudioBuffer, MidiBuffer, TimedBuffer};
pub use clock::{ManualClock, MonotonicClock, TimeSource};
pub use config::SyncConfig;
pub use entry::{AudioChunk, Metadata, MidiEvent, MidiEventKind, TimedEntry, Timestamped};
pub use error::{CoreError, CoreResult, MidiParseError, PcmError};
pub use sync::{AudioSourceSnapshot, MidiSourceSnapshot, SyncManager, SyncSnapshot};
