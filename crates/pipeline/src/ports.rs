//! Port traits for the external collaborators the pipeline consumes.
//!
//! Infrastructure crates implement these; the pipeline and the dispatcher only
//! ever see the traits. All three calls may block on network I/O and are the
//! only suspension points in a pipeline run.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    CommitSha, DecodedNotification, FetchError, FetchedMessage, JobHandle, JobRequest, MessageId,
    RepositoryId, Timestamp, TriggerError,
};

/// Fetches the message a notification refers to.
#[async_trait]
pub trait MessageFetcher: Send + Sync {
    /// Returns the newest message added at or after the notification's history
    /// position, or the pinned message when the notification carries a message id.
    ///
    /// # Errors
    ///
    /// - [`FetchError::NotFound`] when no such message exists.
    /// - [`FetchError::Transient`] on network or availability failure.
    async fn fetch_message(
        &self,
        notification: &DecodedNotification,
    ) -> Result<FetchedMessage, FetchError>;

    /// Marks a message as handled once its job has been dispatched, so later
    /// lookups for the same mailbox no longer offer it.
    ///
    /// The default does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Transient`] if the mailbox could not be updated.
    /// The dispatch outcome is unaffected.
    async fn mark_processed(
        &self,
        _notification: &DecodedNotification,
        _message_id: &MessageId,
    ) -> Result<(), FetchError> {
        Ok(())
    }
}

/// Verdict of a source-repository corroboration query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityVerdict {
    /// Matching recent activity was found.
    Matched,
    /// The repository was reachable and showed no matching activity.
    NotMatched,
    /// The repository could not be queried; no conclusion is possible.
    Inconclusive,
}

/// What to look for when corroborating an email against repository activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityQuery {
    /// Repository to query.
    pub repository: RepositoryId,
    /// Reference time, normally when the email was received.
    pub around: Timestamp,
    /// How far before `around` activity counts.
    pub lookback: Duration,
    /// Commit the email names, when it names one.
    pub commit: Option<CommitSha>,
}

/// Checks a source repository for activity that corroborates a CI email.
#[async_trait]
pub trait ActivityVerifier: Send + Sync {
    /// Infallible by contract: collaborator failures map to
    /// [`ActivityVerdict::Inconclusive`] so the caller can apply its policy.
    async fn verify_recent_activity(&self, query: &ActivityQuery) -> ActivityVerdict;
}

/// Starts one downstream job.
#[async_trait]
pub trait JobTrigger: Send + Sync {
    /// Starts the job described by `request`.
    ///
    /// # Errors
    ///
    /// Returns a [`TriggerError`] when the job cannot be confirmed as started.
    async fn trigger_job(&self, request: &JobRequest) -> Result<JobHandle, TriggerError>;
}
