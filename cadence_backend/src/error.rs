use thiserror::Error;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// `submit` after `shutdown`.
    #[error("Thread pool is closed")]
    Closed,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    /// The task was dropped before it produced a result.
    #[error("Task was cancelled before completion")]
    TaskCancelled,
}

/// One failed metric sample. Never fatal to the sampling loop.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    #[error("Metrics unavailable: {0}")]
    Unavailable(String),

    #[error("GPU metrics unavailable: {0}")]
    Gpu(String),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Monitoring is already running")]
    AlreadyRunning,

    #[error("Monitoring interval must be positive")]
    InvalidInterval,

    #[error("Failed to spawn monitor thread: {0}")]
    Spawn(#[source] std::io::Error),
}
