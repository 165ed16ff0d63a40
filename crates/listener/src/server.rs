//! axum routes for the push webhook, health check and operator test endpoint.
//!
//! Every inbound request becomes an [`InboundEvent`] and is dispatched on its
//! own task, so a dropped connection never cancels a run that already holds a
//! claim. The reply waits at most for the configured run deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dispatch::Dispatcher;
use pipeline::{constant_time_eq, InboundEvent, RunId, Timestamp};
use secrecy::{ExposeSecret, SecretString};

use crate::request::{inbound_headers, origin_key, TEST_TOKEN_HEADER};
use crate::response::DispatchReply;

/// HTTP-side settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Bucket requests by the first `X-Forwarded-For` entry instead of the peer IP.
    pub trust_forwarded_for: bool,
    /// How long a handler waits for its run before answering `500`.
    pub run_deadline: Duration,
    /// Token for `POST /test`. The route is not mounted without one.
    pub test_token: Option<SecretString>,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            trust_forwarded_for: false,
            run_deadline: Duration::from_secs(10),
            test_token: None,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    config: Arc<ListenerConfig>,
}

impl AppState {
    /// Wraps the dispatcher and listener settings.
    pub fn new(dispatcher: Arc<Dispatcher>, config: ListenerConfig) -> Self {
        Self {
            dispatcher,
            config: Arc::new(config),
        }
    }
}

/// Builds the relay router. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so handlers see the
/// peer address.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/webhook/gmail-push", post(gmail_push))
        .route("/health", get(health));
    if state.config.test_token.is_some() {
        router = router.route("/test", post(test_push));
    }
    router
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Timestamp::now().to_string(),
    }))
}

async fn gmail_push(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, peer, headers, body, true).await
}

async fn test_push(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(expected) = state.config.test_token.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let provided = headers
        .get(TEST_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !constant_time_eq(provided.as_bytes(), expected.expose_secret().as_bytes()) {
        tracing::warn!(peer = %peer.ip(), "test endpoint token rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "status": "rejected", "reason": "rejected_auth" })),
        )
            .into_response();
    }
    tracing::info!(peer = %peer.ip(), "operator test notification");
    handle(state, peer, headers, body, false).await
}

async fn handle(
    state: AppState,
    peer: SocketAddr,
    headers: HeaderMap,
    body: Bytes,
    authenticate: bool,
) -> Response {
    let Some(origin) = origin_key(peer, &headers, state.config.trust_forwarded_for) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let event = InboundEvent {
        body: body.to_vec(),
        headers: inbound_headers(&headers),
        origin,
        received_at: Timestamp::now(),
    };
    run_with_deadline(&state, event, authenticate)
        .await
        .into_response()
}

/// Runs the pipeline on its own task. Dropping the join handle on timeout
/// detaches the task; it is never aborted.
async fn run_with_deadline(state: &AppState, event: InboundEvent, authenticate: bool) -> DispatchReply {
    let run_id = RunId::new_random();
    let dispatcher = Arc::clone(&state.dispatcher);
    let run = tokio::spawn(async move {
        if authenticate {
            dispatcher.dispatch_with_run_id(run_id, &event).await
        } else {
            dispatcher.dispatch_unauthenticated(run_id, &event).await
        }
    });

    match tokio::time::timeout(state.config.run_deadline, run).await {
        Ok(Ok(result)) => result.into(),
        Ok(Err(e)) => {
            tracing::error!(run_id = %run_id, error = %e, "pipeline run task failed");
            DispatchReply::deadline_exceeded(run_id)
        }
        Err(_) => {
            tracing::warn!(
                run_id = %run_id,
                deadline_ms = state.config.run_deadline.as_millis() as u64,
                "run exceeded deadline; it continues in the background"
            );
            DispatchReply::deadline_exceeded(run_id)
        }
    }
}
