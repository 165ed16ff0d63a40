//! The dispatch pipeline: one linear, short-circuiting run per inbound event.

use std::sync::Arc;

use pipeline::{
    ActivityVerifier, ClaimRegistry, ConfigError, ContentRejection, ContentValidator,
    DecodedNotification, DispatchOutcome, DispatchResult, FetchError, FetchedMessage,
    InMemorySeenSet, InboundEvent, InconclusivePolicy, JobRequest, JobTrigger, MessageFetcher,
    NotificationKey, OriginAuthenticator, PipelineConfig, PipelineState, RateLimiter, Rejection,
    RunId, SlidingWindowRateLimiter, Timestamp, UpstreamFailure, ValidationOutcome,
};
use secrecy::SecretString;
use tracing::Instrument;

/// External collaborators the dispatcher calls.
#[derive(Clone)]
pub struct Collaborators {
    /// Fetches the message a notification refers to.
    pub fetcher: Arc<dyn MessageFetcher>,
    /// Corroborates emails against repository activity. Required when source
    /// verification is enabled.
    pub verifier: Option<Arc<dyn ActivityVerifier>>,
    /// Starts the downstream job.
    pub trigger: Arc<dyn JobTrigger>,
}

/// Counts removed by one eviction sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Origin keys dropped from the rate limiter.
    pub rate_keys: usize,
    /// Claims dropped from the duplicate suppressor.
    pub claims: usize,
}

/// Runs inbound events through
/// `authenticate → rate limit → decode → claim → fetch + validate → trigger`.
///
/// Shared across all concurrent runs; the only shared mutable state is inside
/// the rate limiter and the claim registry.
pub struct Dispatcher {
    authenticator: OriginAuthenticator,
    rate_limiter: Arc<dyn RateLimiter>,
    claims: Arc<dyn ClaimRegistry>,
    validator: ContentValidator,
    fetcher: Arc<dyn MessageFetcher>,
    trigger: Arc<dyn JobTrigger>,
    inconclusive: InconclusivePolicy,
}

impl Dispatcher {
    /// Creates a dispatcher with in-memory rate-limit and claim state.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` is invalid or source verification
    /// is enabled without a verifier.
    pub fn new(
        config: PipelineConfig,
        secret: SecretString,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        let rate_limiter = Arc::new(SlidingWindowRateLimiter::new(config.rate_limit.clone()));
        let claims = Arc::new(InMemorySeenSet::new(config.retention.clone()));
        Self::with_stores(config, secret, collaborators, rate_limiter, claims)
    }

    /// Creates a dispatcher over caller-supplied rate-limit and claim stores.
    ///
    /// # Errors
    ///
    /// Same as [`Dispatcher::new`].
    pub fn with_stores(
        config: PipelineConfig,
        secret: SecretString,
        collaborators: Collaborators,
        rate_limiter: Arc<dyn RateLimiter>,
        claims: Arc<dyn ClaimRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let inconclusive = config.content.source_verification.inconclusive;
        let validator = ContentValidator::new(config.content, collaborators.verifier)?;
        Ok(Self {
            authenticator: OriginAuthenticator::new(secret, config.signature),
            rate_limiter,
            claims,
            validator,
            fetcher: collaborators.fetcher,
            trigger: collaborators.trigger,
            inconclusive,
        })
    }

    /// Runs a transport event through the full pipeline.
    pub async fn dispatch(&self, event: &InboundEvent) -> DispatchResult {
        self.dispatch_with_run_id(RunId::new_random(), event).await
    }

    /// Like [`Self::dispatch`], with a caller-chosen run id so the caller can
    /// correlate its own logs with the run.
    pub async fn dispatch_with_run_id(&self, run_id: RunId, event: &InboundEvent) -> DispatchResult {
        self.run(run_id, event, true).await
    }

    /// Runs an operator-supplied event through every gate except origin
    /// authentication. Callers must apply their own access control.
    pub async fn dispatch_unauthenticated(&self, run_id: RunId, event: &InboundEvent) -> DispatchResult {
        self.run(run_id, event, false).await
    }

    /// Evicts expired rate-limit and claim state.
    pub fn sweep(&self, now: Timestamp) -> SweepReport {
        SweepReport {
            rate_keys: self.rate_limiter.sweep(now),
            claims: self.claims.evict_expired(now),
        }
    }

    async fn run(&self, run_id: RunId, event: &InboundEvent, authenticate: bool) -> DispatchResult {
        let span = tracing::info_span!(
            "dispatch",
            run_id = %run_id,
            origin = %event.origin,
            authenticated = authenticate,
        );
        async move {
            let result = self.run_gates(run_id, event, authenticate).await;
            log_outcome(&result);
            result
        }
        .instrument(span)
        .await
    }

    async fn run_gates(
        &self,
        run_id: RunId,
        event: &InboundEvent,
        authenticate: bool,
    ) -> DispatchResult {
        let now = event.received_at;

        // Received → Authenticated
        if authenticate && !self.authenticator.authenticate(&event.headers, &event.body, now) {
            return DispatchResult::early(run_id, DispatchOutcome::Rejected(Rejection::Auth));
        }

        // Authenticated → RateChecked
        if let Err(limited) = self.rate_limiter.check(&event.origin, now) {
            return DispatchResult::early(
                run_id,
                DispatchOutcome::Rejected(Rejection::RateLimited {
                    retry_after: limited.retry_after,
                }),
            );
        }

        // RateChecked → Decoded
        let decoded = match pipeline::decode_notification(&event.body, now) {
            Ok(decoded) => decoded,
            Err(e) => {
                return DispatchResult::early(run_id, DispatchOutcome::Rejected(Rejection::Decode(e)))
            }
        };
        let key = decoded.key();
        let mut result = DispatchResult {
            run_id,
            outcome: DispatchOutcome::Rejected(Rejection::Duplicate),
            notification: Some(key.clone()),
            history_id: Some(decoded.history_id),
            message_id: decoded.message_id.clone(),
        };

        // Decoded → Claimed
        if !self.claims.claim(&key, now) {
            return result;
        }
        tracing::debug!(notification = %key, "notification claimed");

        // Claimed → ContentValidated → Dispatched
        let outcome = self
            .validate_and_trigger(run_id, &decoded, &key, now, &mut result)
            .await;
        result.outcome = outcome;
        result
    }

    async fn validate_and_trigger(
        &self,
        run_id: RunId,
        decoded: &DecodedNotification,
        key: &NotificationKey,
        now: Timestamp,
        result: &mut DispatchResult,
    ) -> DispatchOutcome {
        let message = match self.fetcher.fetch_message(decoded).await {
            Ok(message) => message,
            Err(FetchError::NotFound(detail)) => {
                tracing::info!(notification = %key, %detail, "no message for notification");
                return DispatchOutcome::Rejected(Rejection::Content(
                    ContentRejection::MessageNotFound,
                ));
            }
            Err(e @ FetchError::Transient(_)) => {
                return DispatchOutcome::ErrorUpstream {
                    failure: UpstreamFailure::Fetch(e),
                    claimed: true,
                };
            }
        };
        result.message_id = Some(message.message_id.clone());

        // A history-keyed claim is widened to the message itself, so a second
        // notification for an already handled message is also suppressed.
        if matches!(key, NotificationKey::History { .. }) {
            let message_key = NotificationKey::Message {
                mailbox: decoded.mailbox.clone(),
                message: message.message_id.clone(),
            };
            if !self.claims.claim(&message_key, now) {
                return DispatchOutcome::Rejected(Rejection::Duplicate);
            }
        }

        let content = match self.validator.validate(decoded, &message).await {
            ValidationOutcome::Accepted(content) => content,
            ValidationOutcome::RejectedSubject => {
                return content_rejected(&message, ContentRejection::Subject)
            }
            ValidationOutcome::RejectedBuildNumber => {
                return content_rejected(&message, ContentRejection::BuildNumber)
            }
            ValidationOutcome::RejectedSourceMismatch => {
                return content_rejected(&message, ContentRejection::SourceMismatch)
            }
            ValidationOutcome::SourceInconclusive(content) => match self.inconclusive {
                InconclusivePolicy::Reject => {
                    return content_rejected(&message, ContentRejection::SourceInconclusive)
                }
                InconclusivePolicy::Accept => {
                    tracing::warn!(
                        message_id = %message.message_id,
                        "source verification inconclusive; accepting under fail-open policy"
                    );
                    content
                }
            },
        };
        tracing::debug!(
            state = ?PipelineState::ContentValidated,
            build_number = %content.build_number,
            "content validated"
        );

        let request = JobRequest {
            run_id,
            notification: key.clone(),
            message_id: message.message_id.clone(),
            subject: message.subject.clone(),
            build_number: content.build_number,
            parameters: content.parameters,
        };
        match self.trigger.trigger_job(&request).await {
            Ok(job) => {
                if let Err(e) = self
                    .fetcher
                    .mark_processed(decoded, &request.message_id)
                    .await
                {
                    tracing::warn!(
                        message_id = %request.message_id,
                        error = %e,
                        "could not mark message processed"
                    );
                }
                DispatchOutcome::Dispatched {
                    build_number: request.build_number,
                    job,
                }
            }
            Err(e) => {
                tracing::error!(
                    notification = %key,
                    message_id = %request.message_id,
                    build_number = %request.build_number,
                    retry_policy = ?e.retry_policy(),
                    error = %e,
                    "job trigger failed after claim; notification stays claimed, manual retrigger required"
                );
                DispatchOutcome::ErrorUpstream {
                    failure: UpstreamFailure::Trigger(e),
                    claimed: true,
                }
            }
        }
    }
}

fn content_rejected(message: &FetchedMessage, reason: ContentRejection) -> DispatchOutcome {
    tracing::warn!(
        message_id = %message.message_id,
        subject = %message.subject,
        sender = message.sender.as_deref().unwrap_or(""),
        reason = reason.code(),
        "message failed content validation"
    );
    DispatchOutcome::Rejected(Rejection::Content(reason))
}

fn log_outcome(result: &DispatchResult) {
    let state = result.state();
    debug_assert!(state.is_terminal(), "run finished in non-terminal state {state:?}");
    let notification = result.notification.as_ref().map(ToString::to_string);
    let notification = notification.as_deref().unwrap_or("-");
    let reason = result.outcome.reason_code();
    match &result.outcome {
        DispatchOutcome::Dispatched { build_number, job } => tracing::info!(
            notification,
            ?state,
            %build_number,
            queue_url = job.queue_url.as_deref().unwrap_or(""),
            "job dispatched"
        ),
        DispatchOutcome::Rejected(Rejection::Duplicate) => {
            tracing::debug!(notification, ?state, reason, "duplicate notification ignored")
        }
        DispatchOutcome::Rejected(Rejection::Decode(e)) => {
            tracing::warn!(?state, reason, error = %e, "notification rejected")
        }
        DispatchOutcome::Rejected(_) => {
            tracing::warn!(notification, ?state, reason, "notification rejected")
        }
        DispatchOutcome::ErrorUpstream { failure, claimed } => tracing::error!(
            notification,
            ?state,
            stage = ?failure.stage(),
            claimed,
            error = %failure,
            "upstream failure"
        ),
    }
}
