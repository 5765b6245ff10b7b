use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to decode a raw MIDI message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MidiParseError {
    #[error("Empty MIDI message")]
    Empty,

    #[error("Truncated MIDI message: status 0x{status:02X} needs 3 bytes, got {len}")]
    Truncated { status: u8, len: usize },
}

/// Failure to decode raw PCM bytes into samples.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PcmError {
    #[error("PCM16 payload has odd length {0}")]
    OddLength(usize),
}
