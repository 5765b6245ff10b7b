//! Fans a synchronized snapshot out to the pool for feature extraction.
//!
//! The extraction algorithms themselves live behind [`FeatureExtractor`]; this
//! module only batches, picks the execution target and collects results.

use std::collections::BTreeMap;
use std::sync::Arc;

use cadence_core::{AudioChunk, MidiEvent, SyncManager};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PoolError, PoolResult};
use crate::pool::{OptimizedThreadPool, TaskHandle};

/// Named scalar features for one batch.
pub type FeatureRecord = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTarget {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Audio,
    Midi,
}

pub trait FeatureExtractor: Send + Sync + 'static {
    fn extract_audio(&self, source_id: &str, chunks: &[AudioChunk], target: ExecutionTarget) -> FeatureRecord;

    fn extract_midi(&self, source_id: &str, events: &[MidiEvent], target: ExecutionTarget) -> FeatureRecord;
}

/// Features computed from one batch of one source.
#[derive(Debug, Clone, Serialize)]
pub struct BatchFeatures {
    pub source_id: String,
    pub kind: SourceKind,
    pub batch_index: usize,
    pub entries: usize,
    pub target: ExecutionTarget,
    pub features: FeatureRecord,
}

pub struct ExtractionDispatcher<E: FeatureExtractor> {
    sync: Arc<SyncManager>,
    pool: Arc<OptimizedThreadPool>,
    extractor: Arc<E>,
}

impl<E: FeatureExtractor> ExtractionDispatcher<E> {
    pub fn new(sync: Arc<SyncManager>, pool: Arc<OptimizedThreadPool>, extractor: E) -> Self {
        Self {
            sync,
            pool,
            extractor: Arc::new(extractor),
        }
    }

    /// Extract features from the last `duration` seconds of every source.
    ///
    /// Each source is split into batches of the pool's current batch size
    /// and every batch runs as its own task. A batch whose task panics is
    /// logged and left out of the result; a closed pool is an error.
    pub fn dispatch(&self, duration: f64) -> PoolResult<Vec<BatchFeatures>> {
        let snapshot = self.sync.get_synchronized_data(duration);
        let target = if self.pool.resource_manager().should_use_gpu() {
            ExecutionTarget::Gpu
        } else {
            ExecutionTarget::Cpu
        };
        let batch_size = self.pool.batch_size().max(1);

        let mut handles: Vec<TaskHandle<BatchFeatures>> = Vec::new();
        for (source_id, source) in snapshot.audio {
            for (batch_index, batch) in source.chunks.chunks(batch_size).enumerate() {
                let extractor = Arc::clone(&self.extractor);
                let source_id = source_id.clone();
                let batch = batch.to_vec();
                handles.push(self.pool.submit(move || BatchFeatures {
                    features: extractor.extract_audio(&source_id, &batch, target),
                    entries: batch.len(),
                    source_id,
                    kind: SourceKind::Audio,
                    batch_index,
                    target,
                })?);
            }
        }
        for (source_id, source) in snapshot.midi {
            for (batch_index, batch) in source.events.chunks(batch_size).enumerate() {
                let extractor = Arc::clone(&self.extractor);
                let source_id = source_id.clone();
                let batch = batch.to_vec();
                handles.push(self.pool.submit(move || BatchFeatures {
                    features: extractor.extract_midi(&source_id, &batch, target),
                    entries: batch.len(),
                    source_id,
                    kind: SourceKind::Midi,
                    batch_index,
                    target,
                })?);
            }
        }

        debug!(tasks = handles.len(), batch_size, ?target, "dispatched extraction batches");

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(features) => results.push(features),
                Err(PoolError::Closed) => return Err(PoolError::Closed),
                Err(e) => warn!(error = %e, "extraction batch failed"),
            }
        }
        Ok(results)
    }
}
