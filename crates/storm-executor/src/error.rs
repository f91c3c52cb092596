//! Executor error types.

use storm_api::ApiError;
use thiserror::Error;

/// Errors raised by reconcilers and handler workers.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("recipe error: {0}")]
    Recipe(String),

    #[error("handler error: {0}")]
    Handler(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

impl ExecutorError {
    /// Fatal errors abort the executor; everything else is retried on
    /// the next tick. Desired state the executor cannot interpret is
    /// never going to fix itself.
    pub fn is_fatal(&self) -> bool {
        match self {
            ExecutorError::Config(_) => true,
            ExecutorError::Recipe(_) => true,
            ExecutorError::Handler(_) => false,
            ExecutorError::Api(e) => matches!(e, ApiError::Validation(_)),
        }
    }
}
