//! Live input capture feeding a [`SyncManager`] audio source.
//!
//! The cpal callback only downmixes, stamps and hands chunks to a bounded
//! channel with `try_send`; it never touches the sync buffers. A forwarder
//! thread drains the channel and calls `add_audio_chunk`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use cadence_core::{AudioChunk, SyncManager, TimeSource};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::enumeration::{EnumError, InputDeviceEnumerator};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Enumeration(#[from] EnumError),

    #[error("Failed to read default input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("Failed to build input stream: {0}")]
    Build(#[from] cpal::BuildStreamError),

    #[error("Failed to start input stream: {0}")]
    Play(#[from] cpal::PlayStreamError),

    #[error("Unsupported input sample format: {0:?}")]
    UnsupportedFormat(cpal::SampleFormat),

    #[error("Failed to spawn forwarder thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Audio source id the chunks are ingested under.
    pub source_id: String,
    /// Substring of the device name; `None` picks the default input.
    pub device_name: Option<String>,
    /// Mono frames per chunk.
    pub chunk_frames: usize,
    /// Chunks buffered between the callback and the forwarder.
    pub queue_depth: usize,
}

impl CaptureConfig {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            device_name: None,
            chunk_frames: 1024,
            queue_depth: 64,
        }
    }

    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    pub fn with_chunk_frames(mut self, frames: usize) -> Self {
        self.chunk_frames = frames.max(1);
        self
    }
}

/// Counters shared with the audio callback.
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub chunks_captured: AtomicU64,
    pub overruns: AtomicU64,
    pub stream_errors: AtomicU64,
}

pub struct InputCapture {
    stream: Option<cpal::Stream>,
    forwarder: Option<JoinHandle<()>>,
    stats: Arc<CaptureStats>,
    source_id: String,
    sample_rate: u32,
    channels: u16,
}

impl InputCapture {
    /// Open the configured input device and start streaming into `sync`.
    ///
    /// Registers the audio source with the manager's default capacity if it
    /// is not registered yet.
    pub fn start(sync: Arc<SyncManager>, config: CaptureConfig) -> Result<Self, CaptureError> {
        let enumerator = InputDeviceEnumerator::new()?;
        let info = match &config.device_name {
            Some(name) => enumerator.find_device_by_name(name)?,
            None => enumerator.default_input_device()?,
        };
        let device = enumerator.select_device(info)?;
        let supported = device.default_input_config()?;
        let sample_format = supported.sample_format();
        let stream_config: cpal::StreamConfig = supported.into();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels;

        sync.register_audio_source(&config.source_id, sync.default_capacity());

        let (chunk_tx, chunk_rx) = channel::bounded::<AudioChunk>(config.queue_depth.max(1));
        let stats = Arc::new(CaptureStats::default());
        let chunker = Chunker {
            clock: sync.clock(),
            sender: chunk_tx,
            stats: Arc::clone(&stats),
            pending: Vec::with_capacity(config.chunk_frames),
            chunk_frames: config.chunk_frames.max(1),
            channels: usize::from(channels.max(1)),
            sample_rate,
        };

        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_stream::<f32>(device, &stream_config, chunker, &stats)?,
            cpal::SampleFormat::I16 => build_stream::<i16>(device, &stream_config, chunker, &stats)?,
            cpal::SampleFormat::U16 => build_stream::<u16>(device, &stream_config, chunker, &stats)?,
            cpal::SampleFormat::I32 => build_stream::<i32>(device, &stream_config, chunker, &stats)?,
            other => return Err(CaptureError::UnsupportedFormat(other)),
        };

        let source_id = config.source_id.clone();
        let forwarder = thread::Builder::new()
            .name(format!("capture-{source_id}"))
            .spawn(move || forward_chunks(chunk_rx, sync, source_id))
            .map_err(CaptureError::Spawn)?;

        stream.play()?;
        info!(
            device = %info.name,
            source = %config.source_id,
            sample_rate,
            channels,
            ?sample_format,
            "input capture started"
        );

        Ok(Self {
            stream: Some(stream),
            forwarder: Some(forwarder),
            stats,
            source_id: config.source_id,
            sample_rate,
            channels,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Stop the stream and wait for the forwarder to drain.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the stream drops the callback and with it the only sender
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!(error = %e, "pausing input stream failed");
            }
            drop(stream);
        }
        if let Some(handle) = self.forwarder.take() {
            if handle.join().is_err() {
                error!(source = %self.source_id, "capture forwarder panicked");
            }
            info!(
                source = %self.source_id,
                chunks = self.stats.chunks_captured.load(Ordering::Relaxed),
                overruns = self.stats.overruns.load(Ordering::Relaxed),
                "input capture stopped"
            );
        }
    }
}

impl Drop for InputCapture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut chunker: Chunker,
    stats: &Arc<CaptureStats>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let error_stats = Arc::clone(stats);
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| chunker.push_interleaved(data),
        move |err| {
            error_stats.stream_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %err, "input stream error");
        },
        None,
    )
}

fn forward_chunks(chunks: Receiver<AudioChunk>, sync: Arc<SyncManager>, source_id: String) {
    while let Ok(chunk) = chunks.recv() {
        if !sync.add_audio_chunk(&source_id, chunk) {
            warn!(source = %source_id, "capture source no longer registered, dropping chunk");
        }
    }
    debug!(source = %source_id, "capture forwarder exiting");
}

/// Accumulates downmixed frames and emits fixed-size, timestamped chunks.
struct Chunker {
    clock: Arc<dyn TimeSource>,
    sender: Sender<AudioChunk>,
    stats: Arc<CaptureStats>,
    pending: Vec<f32>,
    chunk_frames: usize,
    channels: usize,
    sample_rate: u32,
}

impl Chunker {
    fn push_interleaved<T>(&mut self, data: &[T])
    where
        T: Sample,
        f32: FromSample<T>,
    {
        for frame in data.chunks_exact(self.channels) {
            self.pending.push(downmix(frame));
            if self.pending.len() == self.chunk_frames {
                self.emit();
            }
        }
    }

    fn emit(&mut self) {
        let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.chunk_frames));
        // Stamp with the capture time of the first frame
        let span = samples.len() as f64 / f64::from(self.sample_rate.max(1));
        let timestamp = self.clock.now() - span;
        match self.sender.try_send(AudioChunk::new(samples, self.sample_rate, timestamp)) {
            Ok(()) => {
                self.stats.chunks_captured.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.overruns.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn downmix<T>(frame: &[T]) -> f32
where
    T: Sample,
    f32: FromSample<T>,
{
    let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
    sum / frame.len().max(1) as f32
}
