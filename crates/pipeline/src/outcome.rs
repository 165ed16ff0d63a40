//! Terminal outcomes of a pipeline run.
//!
//! Every run ends in exactly one [`PipelineState`] terminal state. The
//! [`DispatchResult`] carries that state together with the identifiers
//! involved, for the HTTP response and the audit log.
//!
//! ## Failure after a claim
//!
//! When the job trigger (or any collaborator after the claim) fails, the
//! claim is **kept**. A transport redelivery is then absorbed as
//! [`Rejection::Duplicate`] rather than starting a second job. This is a
//! fail-closed tradeoff: a lost trigger is preferred over a double trigger,
//! and an operator retriggers manually using the identifiers in the
//! `ErrorUpstream` log event.

use std::time::Duration;

use serde::Serialize;

use crate::{
    BuildNumber, DecodeError, FetchError, HistoryId, JobHandle, MessageId, NotificationKey, RunId,
    TriggerError,
};

/// States of the dispatch state machine.
///
/// Runs advance strictly left to right through
/// `Received → Authenticated → RateChecked → Decoded → Claimed → ContentValidated → Dispatched`;
/// any failing gate jumps to the matching terminal failure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Event accepted from the transport.
    Received,
    /// Origin signature verified.
    Authenticated,
    /// Rate limit admitted the event.
    RateChecked,
    /// Envelope decoded.
    Decoded,
    /// Notification identifier claimed.
    Claimed,
    /// Content checks passed.
    ContentValidated,
    /// Job trigger confirmed. Terminal.
    Dispatched,
    /// Signature missing or invalid. Terminal.
    RejectedAuth,
    /// Origin over its rate limit. Terminal.
    RejectedRate,
    /// Envelope malformed. Terminal.
    RejectedDecode,
    /// Identifier already claimed. Terminal.
    RejectedDuplicate,
    /// Content checks failed. Terminal.
    RejectedContent,
    /// A collaborator failed. Terminal.
    ErrorUpstream,
}

impl PipelineState {
    /// Returns `true` for terminal states.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            Self::Received
                | Self::Authenticated
                | Self::RateChecked
                | Self::Decoded
                | Self::Claimed
                | Self::ContentValidated
        )
    }
}

/// Why content validation rejected a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentRejection {
    /// No message matched the notification.
    MessageNotFound,
    /// Subject lacks the configured filter.
    Subject,
    /// No build number could be extracted.
    BuildNumber,
    /// Repository activity did not corroborate the email.
    SourceMismatch,
    /// Repository activity could not be checked; rejected fail-closed.
    SourceInconclusive,
}

impl ContentRejection {
    /// Coarse reason code, safe to return to callers.
    pub fn code(self) -> &'static str {
        match self {
            Self::MessageNotFound => "message_not_found",
            Self::Subject => "rejected_subject",
            Self::BuildNumber => "rejected_build_number",
            Self::SourceMismatch => "rejected_source_mismatch",
            Self::SourceInconclusive => "rejected_source_inconclusive",
        }
    }
}

/// A deliberate, non-retryable refusal to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Origin authentication failed.
    Auth,
    /// Origin key exceeded its rate limit.
    RateLimited {
        /// When the origin may try again.
        retry_after: Duration,
    },
    /// The envelope could not be decoded.
    Decode(DecodeError),
    /// The notification was already claimed.
    Duplicate,
    /// The message failed content validation.
    Content(ContentRejection),
}

/// Collaborator stage at which an upstream failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStage {
    /// Fetching the message.
    Fetch,
    /// Starting the job.
    Trigger,
    /// The run exceeded its deadline before reporting back.
    Deadline,
}

/// Collaborator failure detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// Message fetch failed transiently.
    Fetch(FetchError),
    /// Job trigger failed.
    Trigger(TriggerError),
    /// The run did not finish within the deadline.
    Deadline,
}

impl UpstreamFailure {
    /// Stage the failure belongs to.
    pub fn stage(&self) -> UpstreamStage {
        match self {
            Self::Fetch(_) => UpstreamStage::Fetch,
            Self::Trigger(_) => UpstreamStage::Trigger,
            Self::Deadline => UpstreamStage::Deadline,
        }
    }
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "{e}"),
            Self::Trigger(e) => write!(f, "{e}"),
            Self::Deadline => write!(f, "run deadline exceeded"),
        }
    }
}

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Exactly one job was started.
    Dispatched {
        /// Build number the job was started for.
        build_number: BuildNumber,
        /// Receipt from the job trigger.
        job: JobHandle,
    },
    /// The event was refused at a gate.
    Rejected(Rejection),
    /// A collaborator failed.
    ErrorUpstream {
        /// What failed.
        failure: UpstreamFailure,
        /// Whether the notification identifier had already been claimed
        /// (and therefore stays claimed).
        claimed: bool,
    },
}

impl DispatchOutcome {
    /// Terminal state this outcome corresponds to.
    pub fn state(&self) -> PipelineState {
        match self {
            Self::Dispatched { .. } => PipelineState::Dispatched,
            Self::Rejected(Rejection::Auth) => PipelineState::RejectedAuth,
            Self::Rejected(Rejection::RateLimited { .. }) => PipelineState::RejectedRate,
            Self::Rejected(Rejection::Decode(_)) => PipelineState::RejectedDecode,
            Self::Rejected(Rejection::Duplicate) => PipelineState::RejectedDuplicate,
            Self::Rejected(Rejection::Content(_)) => PipelineState::RejectedContent,
            Self::ErrorUpstream { .. } => PipelineState::ErrorUpstream,
        }
    }

    /// Coarse reason code, safe to return to callers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Dispatched { .. } => "dispatched",
            Self::Rejected(Rejection::Auth) => "rejected_auth",
            Self::Rejected(Rejection::RateLimited { .. }) => "rejected_rate",
            Self::Rejected(Rejection::Decode(_)) => "rejected_decode",
            Self::Rejected(Rejection::Duplicate) => "rejected_duplicate",
            Self::Rejected(Rejection::Content(reason)) => reason.code(),
            Self::ErrorUpstream { .. } => "error_upstream",
        }
    }
}

/// Outcome of one pipeline run plus the identifiers involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    /// Run this result belongs to.
    pub run_id: RunId,
    /// How the run ended.
    pub outcome: DispatchOutcome,
    /// Claim identifier, once the envelope was decoded.
    pub notification: Option<NotificationKey>,
    /// History id, once the envelope was decoded.
    pub history_id: Option<HistoryId>,
    /// Fetched message id, once the message was fetched.
    pub message_id: Option<MessageId>,
}

impl DispatchResult {
    /// Result for a run that ended before anything was decoded.
    pub fn early(run_id: RunId, outcome: DispatchOutcome) -> Self {
        Self {
            run_id,
            outcome,
            notification: None,
            history_id: None,
            message_id: None,
        }
    }

    /// Terminal state of the run.
    pub fn state(&self) -> PipelineState {
        self.outcome.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_terminal_states() {
        let cases = [
            (DispatchOutcome::Rejected(Rejection::Auth), PipelineState::RejectedAuth),
            (
                DispatchOutcome::Rejected(Rejection::RateLimited {
                    retry_after: Duration::from_secs(1),
                }),
                PipelineState::RejectedRate,
            ),
            (
                DispatchOutcome::Rejected(Rejection::Decode(DecodeError::MissingMessage)),
                PipelineState::RejectedDecode,
            ),
            (DispatchOutcome::Rejected(Rejection::Duplicate), PipelineState::RejectedDuplicate),
            (
                DispatchOutcome::Rejected(Rejection::Content(ContentRejection::Subject)),
                PipelineState::RejectedContent,
            ),
            (
                DispatchOutcome::ErrorUpstream {
                    failure: UpstreamFailure::Deadline,
                    claimed: false,
                },
                PipelineState::ErrorUpstream,
            ),
        ];

        for (outcome, state) in cases {
            assert_eq!(outcome.state(), state);
            assert!(state.is_terminal());
        }
        assert!(!PipelineState::Claimed.is_terminal());
    }

    #[test]
    fn reason_codes_do_not_carry_details() {
        let outcome = DispatchOutcome::Rejected(Rejection::Decode(DecodeError::InvalidEnvelope(
            "secret detail".into(),
        )));
        assert_eq!(outcome.reason_code(), "rejected_decode");

        let outcome = DispatchOutcome::ErrorUpstream {
            failure: UpstreamFailure::Trigger(TriggerError::Transport("10.0.0.5 refused".into())),
            claimed: true,
        };
        assert_eq!(outcome.reason_code(), "error_upstream");
        assert_eq!(
            DispatchOutcome::Rejected(Rejection::Content(ContentRejection::SourceInconclusive))
                .reason_code(),
            "rejected_source_inconclusive"
        );
    }
}
