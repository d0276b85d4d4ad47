use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThreadsError {
    #[error("thread controller has already been shut down")]
    AlreadyShutDown,
    #[error("a BackgroundThread may not declare THREAD_TYPE::Control")]
    ControlTypeOnBackgroundThread,
    #[error("scheduler interval must be positive, got {0}")]
    NonPositiveInterval(f64),
}

pub type Result<T> = std::result::Result<T, ThreadsError>;
