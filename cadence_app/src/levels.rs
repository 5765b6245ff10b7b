use std::collections::BTreeSet;

use cadence_backend::{ExecutionTarget, FeatureExtractor, FeatureRecord};
use cadence_core::{AudioChunk, MidiEvent};

/// Signal level and note activity per batch. Runs the same on either target.
pub struct LevelExtractor;

impl FeatureExtractor for LevelExtractor {
    fn extract_audio(&self, _source_id: &str, chunks: &[AudioChunk], _target: ExecutionTarget) -> FeatureRecord {
        let mut peak = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut count = 0usize;
        for sample in chunks.iter().flat_map(|c| c.samples.iter()).map(|&s| f64::from(s)) {
            peak = peak.max(sample.abs());
            sum_sq += sample * sample;
            count += 1;
        }
        let rms = if count == 0 { 0.0 } else { (sum_sq / count as f64).sqrt() };
        let seconds: f64 = chunks.iter().map(AudioChunk::duration).sum();

        FeatureRecord::from([
            ("peak".to_string(), peak),
            ("rms".to_string(), rms),
            ("seconds".to_string(), seconds),
        ])
    }

    fn extract_midi(&self, _source_id: &str, events: &[MidiEvent], _target: ExecutionTarget) -> FeatureRecord {
        let note_ons: Vec<&MidiEvent> = events.iter().filter(|e| e.is_note_on()).collect();
        let distinct: BTreeSet<u8> = note_ons.iter().filter_map(|e| e.note).collect();
        let mean_velocity = if note_ons.is_empty() {
            0.0
        } else {
            note_ons.iter().filter_map(|e| e.velocity).map(f64::from).sum::<f64>() / note_ons.len() as f64
        };

        FeatureRecord::from([
            ("note_ons".to_string(), note_ons.len() as f64),
            ("distinct_notes".to_string(), distinct.len() as f64),
            ("mean_velocity".to_string(), mean_velocity),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_levels() {
        let chunks = vec![
            AudioChunk::new(vec![0.5, -0.5], 4, 0.0),
            AudioChunk::new(vec![0.5, -1.0], 4, 0.5),
        ];
        let record = LevelExtractor.extract_audio("mic", &chunks, ExecutionTarget::Cpu);
        assert_eq!(record["peak"], 1.0);
        assert!((record["rms"] - (1.75f64 / 4.0).sqrt()).abs() < 1e-9);
        assert_eq!(record["seconds"], 1.0);
    }

    #[test]
    fn test_midi_activity() {
        let events = vec![
            MidiEvent::note_on(60, 100, 0, 0.0),
            MidiEvent::note_on(64, 50, 0, 0.1),
            MidiEvent::note_off(60, 0, 0, 0.2),
            MidiEvent::note_on(60, 90, 0, 0.3),
        ];
        let record = LevelExtractor.extract_midi("keys", &events, ExecutionTarget::Cpu);
        assert_eq!(record["note_ons"], 3.0);
        assert_eq!(record["distinct_notes"], 2.0);
        assert_eq!(record["mean_velocity"], 80.0);
    }

    #[test]
    fn test_empty_batches() {
        let record = LevelExtractor.extract_audio("mic", &[], ExecutionTarget::Gpu);
        assert_eq!(record["rms"], 0.0);
        assert_eq!(LevelExtractor.extract_midi("keys", &[], ExecutionTarget::Gpu)["mean_velocity"], 0.0);
    }
}
