use cadence_backend::{MonitorError, PoolError, ReplayError};
use cadence_core::CoreError;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Thread pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    #[cfg(feature = "capture")]
    #[error("Capture error: {0}")]
    Capture(#[from] cadence_backend::audio_device::CaptureError),

    #[error("Failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to spawn {0} thread: {1}")]
    Spawn(&'static str, #[source] std::io::Error),
}
