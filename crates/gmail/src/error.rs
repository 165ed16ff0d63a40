//! Error types for the Gmail adapter.

use pipeline::FetchError;
use thiserror::Error;

/// Failure talking to the Gmail API.
#[derive(Debug, Error)]
pub enum GmailError {
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
    /// The API rejected the access token or its scopes.
    #[error("gmail rejected credentials with status {status}: {body}")]
    Unauthorized {
        /// `401` or `403`.
        status: u16,
        /// Response body, for the log.
        body: String,
    },
    /// No access token could be obtained.
    #[error("credentials error: {0}")]
    Credentials(String),
    /// The response could not be understood.
    #[error("parse error: {0}")]
    Parse(String),
    /// The mailbox has no message matching the notification.
    #[error("no message found: {0}")]
    NoMessage(String),
}

impl GmailError {
    /// Classifies a non-success response.
    pub(crate) fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized { status, body },
            _ => Self::Status { status, body },
        }
    }

    /// `true` when the failure is about credentials rather than availability.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Credentials(_))
    }
}

impl From<GmailError> for FetchError {
    fn from(error: GmailError) -> Self {
        match error {
            GmailError::Status { status: 404, .. } | GmailError::NoMessage(_) => {
                FetchError::NotFound(error.to_string())
            }
            other => FetchError::Transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_statuses_map_to_not_found() {
        let error = GmailError::Status {
            status: 404,
            body: "Requested entity was not found.".into(),
        };
        assert!(matches!(FetchError::from(error), FetchError::NotFound(_)));
        assert!(matches!(
            FetchError::from(GmailError::NoMessage("history 12".into())),
            FetchError::NotFound(_)
        ));
    }

    #[test]
    fn other_failures_are_transient() {
        let error = GmailError::Status {
            status: 503,
            body: String::new(),
        };
        assert!(matches!(FetchError::from(error), FetchError::Transient(_)));
        assert!(matches!(
            FetchError::from(GmailError::Parse("bad json".into())),
            FetchError::Transient(_)
        ));
    }

    #[test]
    fn rejected_credentials_are_classified_separately() {
        let expired = GmailError::from_status(401, "invalid_grant".into());
        let forbidden = GmailError::from_status(403, "insufficient scope".into());
        let missing = GmailError::from_status(404, String::new());
        assert!(expired.is_auth_failure());
        assert!(forbidden.is_auth_failure());
        assert!(!missing.is_auth_failure());
        assert!(GmailError::Credentials("no key".into()).is_auth_failure());
        assert!(matches!(FetchError::from(expired), FetchError::Transient(_)));
    }
}
