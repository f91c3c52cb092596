//! API client error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the API client.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("resource not found: {path}")]
    NotFound { path: String },

    #[error("api error: status {status}: {body}")]
    Client { status: u16, body: String },

    #[error("connection error: {0}")]
    Connection(#[from] reqwest::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("resolution error: {0}")]
    Resolution(String),

    #[error("trigger {uuid} failed: {reason}")]
    TriggerFailed { uuid: Uuid, reason: String },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Errors worth retrying on the next reconcile tick.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Connection(_) => true,
            ApiError::Client { status, .. } => *status >= 500,
            ApiError::TriggerFailed { .. } => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Client { status: 409, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ApiError::Client {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!ApiError::Client {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!ApiError::Validation("bad".to_string()).is_transient());
        assert!(!ApiError::NotFound {
            path: "/v1/groups/x/".to_string()
        }
        .is_transient());
    }

    #[test]
    fn conflict_detection() {
        assert!(ApiError::Client {
            status: 409,
            body: String::new()
        }
        .is_conflict());
        assert!(!ApiError::Client {
            status: 404,
            body: String::new()
        }
        .is_conflict());
    }
}
