//! Error types for the GitHub adapter.

use thiserror::Error;

/// Failure talking to the GitHub API.
#[derive(Debug, Error)]
pub enum GitHubError {
    /// Underlying HTTP client error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The API answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for the log.
        body: String,
    },
    /// The response body was not a commit list.
    #[error("parse error: {0}")]
    Parse(String),
}
