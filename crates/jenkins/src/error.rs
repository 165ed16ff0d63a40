//! Error types for the Jenkins adapter.

use pipeline::TriggerError;
use thiserror::Error;

/// Longest response-body excerpt kept for the log.
pub(crate) const MAX_BODY_CHARS: usize = 512;

/// Failure talking to Jenkins.
#[derive(Debug, Error)]
pub enum JenkinsError {
    /// Underlying HTTP client error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// Jenkins rejected the user or API token.
    #[error("jenkins rejected credentials with status {status}")]
    Unauthorized {
        /// `401` or `403`.
        status: u16,
    },
    /// Jenkins answered with a status other than `201`/`302`.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated to a short excerpt.
        body: String,
    },
    /// The response could not be understood.
    #[error("parse error: {0}")]
    Parse(String),
}

impl JenkinsError {
    /// Classifies a non-success response, keeping only an excerpt of `body`.
    pub(crate) fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::Unauthorized { status },
            _ => Self::Status {
                status,
                body: excerpt(body),
            },
        }
    }
}

/// First [`MAX_BODY_CHARS`] characters of `body`, marked when cut.
pub(crate) fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX_BODY_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

impl From<JenkinsError> for TriggerError {
    fn from(error: JenkinsError) -> Self {
        match error {
            JenkinsError::Unauthorized { status } => TriggerError::Unauthorized { status },
            JenkinsError::Status { status, body } => TriggerError::UnexpectedStatus {
                status,
                message: body,
            },
            other => TriggerError::Transport(other.to_string()),
        }
    }
}
