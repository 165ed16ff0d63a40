//! Mapping of pipeline outcomes onto HTTP responses.
//!
//! Bodies carry a coarse reason code only. Failure detail stays in the log.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use pipeline::{DispatchOutcome, DispatchResult, Rejection, RunId, UpstreamFailure};
use serde::Serialize;

/// Status code for a terminal outcome.
///
/// Deliberate rejections answer `200` so the push transport does not redeliver
/// them. Upstream failures answer `5xx` so it does.
pub fn status_for(outcome: &DispatchOutcome) -> StatusCode {
    match outcome {
        DispatchOutcome::Dispatched { .. } => StatusCode::OK,
        DispatchOutcome::Rejected(Rejection::Auth) => StatusCode::UNAUTHORIZED,
        DispatchOutcome::Rejected(Rejection::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
        DispatchOutcome::Rejected(_) => StatusCode::OK,
        DispatchOutcome::ErrorUpstream {
            failure: UpstreamFailure::Deadline,
            ..
        } => StatusCode::INTERNAL_SERVER_ERROR,
        DispatchOutcome::ErrorUpstream { claimed: true, .. } => StatusCode::INTERNAL_SERVER_ERROR,
        DispatchOutcome::ErrorUpstream { claimed: false, .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[derive(Debug, Serialize)]
struct ReplyBody {
    status: &'static str,
    reason: &'static str,
    run_id: String,
}

/// HTTP reply for one pipeline run.
#[derive(Debug)]
pub struct DispatchReply {
    run_id: RunId,
    outcome: DispatchOutcome,
}

impl DispatchReply {
    /// Reply for a run that did not report back within the deadline.
    pub fn deadline_exceeded(run_id: RunId) -> Self {
        Self {
            run_id,
            outcome: DispatchOutcome::ErrorUpstream {
                failure: UpstreamFailure::Deadline,
                claimed: false,
            },
        }
    }
}

impl From<DispatchResult> for DispatchReply {
    fn from(result: DispatchResult) -> Self {
        Self {
            run_id: result.run_id,
            outcome: result.outcome,
        }
    }
}

impl IntoResponse for DispatchReply {
    fn into_response(self) -> Response {
        let status = status_for(&self.outcome);
        let body = ReplyBody {
            status: match &self.outcome {
                DispatchOutcome::Dispatched { .. } => "dispatched",
                DispatchOutcome::Rejected(_) => "rejected",
                DispatchOutcome::ErrorUpstream { .. } => "error",
            },
            reason: self.outcome.reason_code(),
            run_id: self.run_id.to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        if let DispatchOutcome::Rejected(Rejection::RateLimited { retry_after }) = &self.outcome {
            // Round up so a client never retries early.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pipeline::{
        BuildNumber, ContentRejection, DecodeError, FetchError, JobHandle, TriggerError,
    };

    use super::*;

    #[test]
    fn rejections_answer_ok_except_auth_and_rate() {
        let content = DispatchOutcome::Rejected(Rejection::Content(ContentRejection::Subject));
        let duplicate = DispatchOutcome::Rejected(Rejection::Duplicate);
        let decode = DispatchOutcome::Rejected(Rejection::Decode(DecodeError::MissingData));
        assert_eq!(status_for(&content), StatusCode::OK);
        assert_eq!(status_for(&duplicate), StatusCode::OK);
        assert_eq!(status_for(&decode), StatusCode::OK);
        assert_eq!(
            status_for(&DispatchOutcome::Rejected(Rejection::Auth)),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&DispatchOutcome::Rejected(Rejection::RateLimited {
                retry_after: Duration::from_secs(3)
            })),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&DispatchOutcome::Dispatched {
                build_number: BuildNumber::new(1),
                job: JobHandle::default(),
            }),
            StatusCode::OK
        );
    }

    #[test]
    fn upstream_failures_answer_server_errors() {
        let before_claim = DispatchOutcome::ErrorUpstream {
            failure: UpstreamFailure::Fetch(FetchError::Transient("reset".into())),
            claimed: false,
        };
        let after_claim = DispatchOutcome::ErrorUpstream {
            failure: UpstreamFailure::Trigger(TriggerError::Transport("refused".into())),
            claimed: true,
        };
        assert_eq!(status_for(&before_claim), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&after_claim), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            DispatchReply::deadline_exceeded(RunId::new_random())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn rate_limited_reply_carries_retry_after() {
        let reply = DispatchReply {
            run_id: RunId::new_random(),
            outcome: DispatchOutcome::Rejected(Rejection::RateLimited {
                retry_after: Duration::from_millis(2_500),
            }),
        };
        let response = reply.into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
    }
}
