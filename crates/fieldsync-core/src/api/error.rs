use thiserror::Error;

use crate::error::FailureReason;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthenticated - token missing or expired")]
    Unauthenticated,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RemoteError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => RemoteError::Unauthenticated,
            403 => RemoteError::AccessDenied(truncated),
            404 => RemoteError::NotFound(truncated),
            408 => RemoteError::Timeout,
            429 => RemoteError::RateLimited,
            500..=599 => RemoteError::ServerError(truncated),
            code => RemoteError::Rejected {
                status: code,
                body: truncated,
            },
        }
    }

    /// Collapse into the reason the coordinator acts on.
    pub fn reason(&self) -> FailureReason {
        match self {
            RemoteError::Unauthenticated => FailureReason::Unauthenticated,
            RemoteError::Timeout => FailureReason::Timeout,
            RemoteError::Network(e) if e.is_timeout() => FailureReason::Timeout,
            RemoteError::Network(_) | RemoteError::RateLimited | RemoteError::ServerError(_) => {
                FailureReason::Unreachable
            }
            // A 404 on a write means the target table or procedure is gone
            RemoteError::AccessDenied(_)
            | RemoteError::NotFound(_)
            | RemoteError::Rejected { .. }
            | RemoteError::InvalidResponse(_) => FailureReason::Rejected,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else if e.is_decode() {
            RemoteError::InvalidResponse(e.to_string())
        } else {
            RemoteError::Network(e)
        }
    }
}
