//! Error and retry-policy types for the relay domain.
//!
//! Gate failures inside a pipeline run are not errors in the `Result` sense:
//! the dispatcher converts them into a terminal [`crate::DispatchOutcome`].
//! The types here cover the genuinely fallible edges: decoding the envelope,
//! calling collaborators, and building the configuration.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any collaborator error that
//! participates in retry decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// - `Retryable` errors: collaborator timeouts, 5xx responses, connection resets.
/// - `NonRetryable` errors: rejected credentials, missing resources, malformed input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// The pipeline configuration is invalid.
///
/// Produced at construction time; the relay never starts with an invalid config.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric setting is zero where a positive value is required.
    #[error("'{setting}' must be greater than zero")]
    MustBePositive {
        /// Name of the offending setting.
        setting: &'static str,
    },

    /// A custom build-number pattern failed to compile or lacks a capture group.
    #[error("invalid build number pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern as configured.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Source verification is enabled without a repository to verify against.
    #[error("source verification is enabled but no repository is configured")]
    MissingRepository,

    /// Source verification is enabled without a verifier to ask.
    #[error("source verification is enabled but no activity verifier is wired")]
    MissingVerifier,

    /// A job-parameter key is empty or contains whitespace.
    #[error("invalid job parameter key '{0}'")]
    InvalidParameterKey(String),

    /// The subject filter is empty.
    #[error("subject filter must not be empty")]
    EmptySubjectFilter,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// The inbound envelope could not be decoded into a notification.
///
/// Never retried: redelivery of a malformed envelope yields the same failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The body is not a JSON document of the expected shape.
    #[error("envelope is not valid JSON: {0}")]
    InvalidEnvelope(String),

    /// The envelope has no `message` object.
    #[error("envelope has no message")]
    MissingMessage,

    /// The message has no (or an empty) `data` field.
    #[error("message has no data")]
    MissingData,

    /// The `data` field is not valid base64.
    #[error("message data is not valid base64")]
    InvalidBase64,

    /// The decoded data is not a JSON payload of the expected shape.
    #[error("notification payload is not valid JSON: {0}")]
    InvalidPayload(String),

    /// A required payload field is missing or empty.
    #[error("notification payload is missing '{0}'")]
    MissingField(&'static str),

    /// `historyId` is present but not an unsigned integer.
    #[error("historyId is not numeric: {0}")]
    InvalidHistoryId(String),
}

// ---------------------------------------------------------------------------
// Collaborator errors
// ---------------------------------------------------------------------------

/// The message-fetch collaborator could not return a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// No message matches the notification.
    #[error("message not found: {0}")]
    NotFound(String),

    /// Network or availability failure; the same request may succeed later.
    #[error("transient fetch failure: {0}")]
    Transient(String),
}

impl FetchError {
    /// Retry classification for this failure.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::NotFound(_) => RetryPolicy::NonRetryable,
            Self::Transient(_) => RetryPolicy::Retryable { after: None },
        }
    }
}

/// The job-trigger collaborator did not confirm that a job was started.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// The target rejected the credentials.
    #[error("job trigger rejected credentials (status {status})")]
    Unauthorized {
        /// HTTP status returned by the target.
        status: u16,
    },

    /// The target answered with an unexpected status.
    #[error("job trigger returned status {status}: {message}")]
    UnexpectedStatus {
        /// HTTP status returned by the target.
        status: u16,
        /// Excerpt of the response body.
        message: String,
    },

    /// Network or availability failure.
    #[error("job trigger transport failure: {0}")]
    Transport(String),
}

impl TriggerError {
    /// Retry classification for this failure.
    ///
    /// The dispatcher never retries on its own; the classification is logged
    /// so an operator knows whether a manual retrigger is safe to attempt.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Unauthorized { .. } => RetryPolicy::NonRetryable,
            Self::UnexpectedStatus { status, .. } if *status >= 500 => {
                RetryPolicy::Retryable { after: None }
            }
            Self::UnexpectedStatus { .. } => RetryPolicy::NonRetryable,
            Self::Transport(_) => RetryPolicy::Retryable { after: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_retry_classification() {
        assert!(!FetchError::NotFound("x".into()).retry_policy().is_retryable());
        assert!(FetchError::Transient("x".into()).retry_policy().is_retryable());
    }

    #[test]
    fn trigger_error_retry_classification() {
        assert_eq!(
            TriggerError::Unauthorized { status: 401 }.retry_policy(),
            RetryPolicy::NonRetryable
        );
        assert!(TriggerError::UnexpectedStatus {
            status: 503,
            message: String::new()
        }
        .retry_policy()
        .is_retryable());
        assert!(!TriggerError::UnexpectedStatus {
            status: 400,
            message: String::new()
        }
        .retry_policy()
        .is_retryable());
        assert!(TriggerError::Transport("reset".into()).retry_policy().is_retryable());
    }
}
