use crate::entry::AudioChunk;

use super::TimedBuffer;

/// Windowed buffer of audio chunks for one source.
pub type AudioBuffer = TimedBuffer<AudioChunk>;

impl AudioBuffer {
    pub fn add_chunk(&self, chunk: AudioChunk) {
        self.add(chunk);
    }

    pub fn get_recent_chunks(&self, duration: f64, now: f64) -> Vec<AudioChunk> {
        self.get_recent(duration, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_chunks_scenario() {
        let buffer = AudioBuffer::new(100, 1.0);
        for ts in [0.0, 0.2, 0.4] {
            buffer.add_chunk(AudioChunk::new(vec![0.1, 0.2], 22050, ts));
        }
        let recent = buffer.get_recent_chunks(0.3, 0.5);
        let stamps: Vec<f64> = recent.iter().map(|c| c.timestamp).collect();
        assert_eq!(stamps, vec![0.2, 0.4]);
        assert_eq!(recent[0].samples, vec![0.1, 0.2]);
    }
}
