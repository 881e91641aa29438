//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to start timer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl QueueError {
    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            QueueError::Spawn(_) => "TIMER_UNAVAILABLE",
        }
    }
}
