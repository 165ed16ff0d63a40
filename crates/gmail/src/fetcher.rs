//! [`MessageFetcher`] over the Gmail REST API.
//!
//! A push notification names the mailbox's *new* history position, so the
//! message behind it is found by reading history from the position seen on the
//! previous push. When there is no earlier position, or it has expired, the
//! newest unread messages are examined instead. Candidates whose subject
//! carries the expected text win over unrelated mail.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use pipeline::{DecodedNotification, FetchError, FetchedMessage, MessageFetcher, MessageId};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;

use crate::auth::AccessTokenSource;
use crate::message::{GmailMessage, HistoryList, MessageList};
use crate::GmailError;

/// Public Gmail REST endpoint.
pub const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Connection and lookup settings for [`GmailMessageFetcher`].
#[derive(Debug, Clone)]
pub struct GmailConfig {
    /// API base URL, without trailing slash.
    pub api_base: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Most messages examined per notification.
    pub max_candidates: u32,
    /// Subject text (case-insensitive) that marks the wanted message among
    /// several candidates. Without it the newest candidate is taken.
    pub subject_hint: Option<String>,
    /// Remove the `UNREAD` label from a message once its job is dispatched.
    pub mark_read: bool,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_GMAIL_API_BASE.to_string(),
            timeout: Duration::from_secs(10),
            max_candidates: 5,
            subject_hint: None,
            mark_read: true,
        }
    }
}

/// [`MessageFetcher`] backed by the Gmail REST API.
pub struct GmailMessageFetcher {
    client: Client,
    config: GmailConfig,
    subject_hint: Option<String>,
    tokens: Arc<dyn AccessTokenSource>,
    /// Last history position seen per mailbox.
    history_marks: DashMap<String, u64>,
}

impl GmailMessageFetcher {
    /// Builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`GmailError::Http`] if the client cannot be constructed.
    pub fn new(
        config: GmailConfig,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Result<Self, GmailError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        let subject_hint = config
            .subject_hint
            .as_deref()
            .map(str::trim)
            .filter(|hint| !hint.is_empty())
            .map(str::to_lowercase);
        Ok(Self {
            client,
            config,
            subject_hint,
            tokens,
            history_marks: DashMap::new(),
        })
    }

    fn user_url(&self, mailbox: &str, path: &str) -> String {
        format!(
            "{}/users/{}/{}",
            self.config.api_base.trim_end_matches('/'),
            mailbox,
            path
        )
    }

    /// Sends an authorized request. A `401` drops the cached token and the
    /// request is retried once with a fresh one.
    async fn send<F>(&self, build: F) -> Result<Response, GmailError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let mut refreshed = false;
        loop {
            let token = self.tokens.access_token().await?;
            let response = build(&self.client)
                .bearer_auth(token.expose_secret())
                .send()
                .await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::UNAUTHORIZED && !refreshed {
                tracing::info!("gmail access token rejected, refreshing");
                self.tokens.invalidate().await;
                refreshed = true;
                continue;
            }
            return Err(GmailError::from_status(status.as_u16(), body));
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, GmailError> {
        let response = self.send(|client| client.get(url).query(query)).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| GmailError::Parse(e.to_string()))
    }

    /// Records `current` as the mailbox's history position and returns the
    /// previous one when `current` moves it forward.
    fn advance_history(&self, mailbox: &str, current: u64) -> Option<u64> {
        let mut mark = self
            .history_marks
            .entry(mailbox.to_string())
            .or_insert(current);
        let previous = *mark;
        if current > previous {
            *mark = current;
            Some(previous)
        } else {
            None
        }
    }

    /// Ids of messages that may have caused the notification, best first.
    async fn candidate_ids(
        &self,
        notification: &DecodedNotification,
    ) -> Result<Vec<String>, GmailError> {
        let mailbox = notification.mailbox.as_str();
        let limit = self.config.max_candidates.max(1);
        let mut candidates = Vec::new();

        if let Some(start) = self.advance_history(mailbox, notification.history_id.as_u64()) {
            let history = self
                .get_json::<HistoryList>(
                    &self.user_url(mailbox, "history"),
                    &[
                        ("startHistoryId", start.to_string()),
                        ("historyTypes", "messageAdded".to_string()),
                    ],
                )
                .await;
            match history {
                Ok(list) => candidates = list.added_newest_first(),
                // An expired history position answers 404; the unread query still works.
                Err(GmailError::Status { status: 404, .. }) => {
                    tracing::debug!(start_history_id = start, "history position expired");
                }
                Err(e) => return Err(e),
            }
        }

        if candidates.is_empty() {
            tracing::debug!(
                history_id = %notification.history_id,
                "no added message in history, examining unread messages"
            );
            let unread = self
                .get_json::<MessageList>(
                    &self.user_url(mailbox, "messages"),
                    &[
                        ("q", "is:unread".to_string()),
                        ("maxResults", limit.to_string()),
                    ],
                )
                .await?;
            candidates = unread.messages.into_iter().map(|m| m.id).collect();
        }

        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn get_message(&self, mailbox: &str, id: &str) -> Result<FetchedMessage, GmailError> {
        self.get_json::<GmailMessage>(
            &self.user_url(mailbox, &format!("messages/{id}")),
            &[("format", "full".to_string())],
        )
        .await?
        .into_fetched()
    }

    fn matches_hint(&self, subject: &str) -> bool {
        self.subject_hint
            .as_deref()
            .map_or(true, |hint| subject.to_lowercase().contains(hint))
    }

    async fn fetch(&self, notification: &DecodedNotification) -> Result<FetchedMessage, GmailError> {
        let mailbox = notification.mailbox.as_str();
        if let Some(pinned) = &notification.message_id {
            return self.get_message(mailbox, pinned.as_str()).await;
        }

        let mut fallback = None;
        for id in self.candidate_ids(notification).await? {
            let message = match self.get_message(mailbox, &id).await {
                Ok(message) => message,
                // Deleted between listing and fetching.
                Err(GmailError::Status { status: 404, .. }) => continue,
                Err(e) => return Err(e),
            };
            if self.matches_hint(&message.subject) {
                return Ok(message);
            }
            tracing::debug!(
                message_id = %message.message_id,
                subject = %message.subject,
                "skipping candidate without expected subject"
            );
            fallback.get_or_insert(message);
        }
        fallback.ok_or_else(|| GmailError::NoMessage(format!("history {}", notification.history_id)))
    }

    async fn remove_unread(&self, mailbox: &str, id: &MessageId) -> Result<(), GmailError> {
        let url = self.user_url(mailbox, &format!("messages/{id}/modify"));
        let body = serde_json::json!({ "removeLabelIds": ["UNREAD"] });
        self.send(|client| client.post(&url).json(&body)).await?;
        Ok(())
    }
}

fn log_failure(notification: &DecodedNotification, error: &GmailError, action: &str) {
    if error.is_auth_failure() {
        tracing::error!(
            mailbox = %notification.mailbox,
            history_id = %notification.history_id,
            error = %error,
            action,
            "gmail credentials rejected; check service account delegation and scopes"
        );
    } else {
        tracing::warn!(
            mailbox = %notification.mailbox,
            history_id = %notification.history_id,
            error = %error,
            action,
            "gmail request failed"
        );
    }
}

#[async_trait]
impl MessageFetcher for GmailMessageFetcher {
    async fn fetch_message(
        &self,
        notification: &DecodedNotification,
    ) -> Result<FetchedMessage, FetchError> {
        match self.fetch(notification).await {
            Ok(message) => {
                tracing::debug!(
                    message_id = %message.message_id,
                    subject = %message.subject,
                    "fetched message"
                );
                Ok(message)
            }
            Err(e) => {
                log_failure(notification, &e, "fetch");
                Err(e.into())
            }
        }
    }

    async fn mark_processed(
        &self,
        notification: &DecodedNotification,
        message_id: &MessageId,
    ) -> Result<(), FetchError> {
        if !self.config.mark_read {
            return Ok(());
        }
        match self.remove_unread(notification.mailbox.as_str(), message_id).await {
            Ok(()) => {
                tracing::debug!(message_id = %message_id, "marked message read");
                Ok(())
            }
            Err(e) => {
                log_failure(notification, &e, "mark_read");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use axum::extract::{Path, Query, State};
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use base64::engine::general_purpose::URL_SAFE;
    use base64::Engine as _;
    use pipeline::{HistoryId, MailboxId, Timestamp};
    use secrecy::SecretString;

    use super::*;
    use crate::StaticToken;

    const MAILBOX: &str = "ci@example.com";
    const CI_SUBJECT: &str = "TheRock Pipeline - Build 1234 Succeeded";

    /// In-process stand-in for the Gmail API.
    #[derive(Default)]
    struct FakeGmail {
        unread: Vec<&'static str>,
        messages: HashMap<&'static str, &'static str>,
        history: Mutex<Option<serde_json::Value>>,
        /// Bearer tokens answered with `401`.
        rejected_tokens: Vec<&'static str>,
        requests: Mutex<Vec<(String, HashMap<String, String>)>>,
        modified: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl FakeGmail {
        fn record(&self, path: &str, query: HashMap<String, String>) {
            self.requests.lock().unwrap().push((path.to_string(), query));
        }

        fn requests_to(&self, suffix: &str) -> Vec<HashMap<String, String>> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(path, _)| path.ends_with(suffix))
                .map(|(_, query)| query.clone())
                .collect()
        }

        fn rejects(&self, headers: &HeaderMap) -> bool {
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            self.rejected_tokens
                .iter()
                .any(|token| auth == format!("Bearer {token}"))
        }
    }

    async fn history(
        State(gmail): State<Arc<FakeGmail>>,
        Query(query): Query<HashMap<String, String>>,
    ) -> AxumResponse {
        gmail.record("history", query);
        match gmail.history.lock().unwrap().clone() {
            Some(list) => Json(list).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn list_messages(
        State(gmail): State<Arc<FakeGmail>>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<serde_json::Value> {
        let limit = query
            .get("maxResults")
            .and_then(|m| m.parse().ok())
            .unwrap_or(100);
        gmail.record("messages", query);
        let ids: Vec<_> = gmail
            .unread
            .iter()
            .take(limit)
            .map(|id| serde_json::json!({ "id": id, "threadId": id }))
            .collect();
        Json(serde_json::json!({ "messages": ids }))
    }

    async fn get_message(
        State(gmail): State<Arc<FakeGmail>>,
        Path((_mailbox, id)): Path<(String, String)>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> AxumResponse {
        gmail.record(&format!("messages/{id}"), query);
        if gmail.rejects(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        match gmail.messages.get(id.as_str()) {
            Some(subject) => Json(message_json(&id, subject)).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn modify(
        State(gmail): State<Arc<FakeGmail>>,
        Path((_mailbox, id)): Path<(String, String)>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        gmail.modified.lock().unwrap().push((id.clone(), body));
        Json(serde_json::json!({ "id": id }))
    }

    fn message_json(id: &str, subject: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "internalDate": "1700000000000",
            "payload": {
                "mimeType": "text/plain",
                "headers": [{"name": "Subject", "value": subject}],
                "body": {"data": URL_SAFE.encode(format!("{subject}\nPLATFORM: linux"))}
            }
        })
    }

    async fn serve(gmail: Arc<FakeGmail>) -> String {
        let app = Router::new()
            .route("/gmail/v1/users/:mailbox/history", get(history))
            .route("/gmail/v1/users/:mailbox/messages", get(list_messages))
            .route("/gmail/v1/users/:mailbox/messages/:id", get(get_message))
            .route("/gmail/v1/users/:mailbox/messages/:id/modify", post(modify))
            .with_state(gmail);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/gmail/v1")
    }

    fn fetcher_for(api_base: String, tokens: Arc<dyn AccessTokenSource>) -> GmailMessageFetcher {
        let config = GmailConfig {
            api_base,
            subject_hint: Some("TheRock Pipeline".to_string()),
            ..GmailConfig::default()
        };
        GmailMessageFetcher::new(config, tokens).unwrap()
    }

    fn fetcher(api_base: String) -> GmailMessageFetcher {
        fetcher_for(
            api_base,
            Arc::new(StaticToken::new(SecretString::from("ya29.valid".to_string()))),
        )
    }

    fn notification(history_id: u64, message_id: Option<&str>) -> DecodedNotification {
        DecodedNotification {
            mailbox: MailboxId::new(MAILBOX).unwrap(),
            history_id: HistoryId::new(history_id),
            message_id: message_id.and_then(MessageId::new),
            received_at: Timestamp::now(),
        }
    }

    #[test]
    fn user_urls_join_cleanly() {
        let fetcher = fetcher("http://localhost:9000/gmail/v1/".to_string());
        assert_eq!(
            fetcher.user_url(MAILBOX, "messages/abc"),
            "http://localhost:9000/gmail/v1/users/ci@example.com/messages/abc"
        );
    }

    #[test]
    fn history_marks_only_move_forward() {
        let fetcher = fetcher("http://localhost:9000/gmail/v1".to_string());
        assert_eq!(fetcher.advance_history(MAILBOX, 100), None);
        assert_eq!(fetcher.advance_history(MAILBOX, 140), Some(100));
        assert_eq!(fetcher.advance_history(MAILBOX, 120), None);
        assert_eq!(fetcher.advance_history(MAILBOX, 180), Some(140));
        assert_eq!(fetcher.advance_history("other@example.com", 5), None);
    }

    #[tokio::test]
    async fn first_push_prefers_unread_message_with_expected_subject() {
        let gmail = Arc::new(FakeGmail {
            unread: vec!["newsletter", "ci-1234"],
            messages: HashMap::from([
                ("newsletter", "Weekly digest"),
                ("ci-1234", CI_SUBJECT),
            ]),
            ..FakeGmail::default()
        });
        let fetcher = fetcher(serve(gmail.clone()).await);

        let message = fetcher.fetch_message(&notification(100, None)).await.unwrap();

        assert_eq!(message.message_id.as_str(), "ci-1234");
        assert_eq!(message.subject, CI_SUBJECT);
        assert!(gmail.requests_to("history").is_empty());
        let listed = gmail.requests_to("messages");
        assert_eq!(listed[0].get("q").map(String::as_str), Some("is:unread"));
        assert_eq!(listed[0].get("maxResults").map(String::as_str), Some("5"));
    }

    #[tokio::test]
    async fn later_push_reads_history_from_previous_position() {
        let gmail = Arc::new(FakeGmail {
            unread: vec!["ci-1234"],
            messages: HashMap::from([
                ("ci-1234", CI_SUBJECT),
                ("ci-1235", "TheRock Pipeline Build 1235"),
            ]),
            ..FakeGmail::default()
        });
        let fetcher = fetcher(serve(gmail.clone()).await);
        fetcher.fetch_message(&notification(100, None)).await.unwrap();

        *gmail.history.lock().unwrap() = Some(serde_json::json!({
            "history": [{"id": "139", "messagesAdded": [{"message": {"id": "ci-1235"}}]}],
            "historyId": "140"
        }));
        let message = fetcher.fetch_message(&notification(140, None)).await.unwrap();

        assert_eq!(message.message_id.as_str(), "ci-1235");
        let history = gmail.requests_to("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].get("startHistoryId").map(String::as_str), Some("100"));
        assert_eq!(
            history[0].get("historyTypes").map(String::as_str),
            Some("messageAdded")
        );
    }

    #[tokio::test]
    async fn expired_history_position_falls_back_to_unread() {
        let gmail = Arc::new(FakeGmail {
            unread: vec!["ci-1234"],
            messages: HashMap::from([("ci-1234", CI_SUBJECT)]),
            ..FakeGmail::default()
        });
        let fetcher = fetcher(serve(gmail.clone()).await);
        fetcher.advance_history(MAILBOX, 10);

        let message = fetcher.fetch_message(&notification(500, None)).await.unwrap();

        assert_eq!(message.message_id.as_str(), "ci-1234");
        assert_eq!(gmail.requests_to("history").len(), 1);
        assert_eq!(gmail.requests_to("messages").len(), 1);
    }

    #[tokio::test]
    async fn unrelated_mail_is_returned_when_nothing_matches() {
        let gmail = Arc::new(FakeGmail {
            unread: vec!["newsletter", "invoice"],
            messages: HashMap::from([("newsletter", "Weekly digest"), ("invoice", "Invoice #88")]),
            ..FakeGmail::default()
        });
        let fetcher = fetcher(serve(gmail).await);

        let message = fetcher.fetch_message(&notification(100, None)).await.unwrap();

        assert_eq!(message.message_id.as_str(), "newsletter");
    }

    #[tokio::test]
    async fn empty_mailbox_is_not_found() {
        let gmail = Arc::new(FakeGmail::default());
        let fetcher = fetcher(serve(gmail).await);

        let result = fetcher.fetch_message(&notification(100, None)).await;

        assert!(matches!(result, Err(FetchError::NotFound(_))));
    }

    #[tokio::test]
    async fn pinned_message_skips_lookup() {
        let gmail = Arc::new(FakeGmail {
            messages: HashMap::from([("pinned", CI_SUBJECT)]),
            ..FakeGmail::default()
        });
        let fetcher = fetcher(serve(gmail.clone()).await);

        let message = fetcher
            .fetch_message(&notification(100, Some("pinned")))
            .await
            .unwrap();

        assert_eq!(message.message_id.as_str(), "pinned");
        assert!(gmail.requests_to("history").is_empty());
        assert!(gmail.requests_to("messages").is_empty());
        assert_eq!(
            gmail.requests_to("messages/pinned")[0].get("format").map(String::as_str),
            Some("full")
        );
    }

    struct RotatingTokens {
        issued: Mutex<Vec<&'static str>>,
        invalidations: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl AccessTokenSource for RotatingTokens {
        async fn access_token(&self) -> Result<SecretString, GmailError> {
            let issued = self.issued.lock().unwrap();
            let current = issued[self.invalidations.load(std::sync::atomic::Ordering::SeqCst)];
            Ok(SecretString::from(current.to_string()))
        }

        async fn invalidate(&self) {
            self.invalidations
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_and_retried_once() {
        let gmail = Arc::new(FakeGmail {
            messages: HashMap::from([("pinned", CI_SUBJECT)]),
            rejected_tokens: vec!["ya29.expired"],
            ..FakeGmail::default()
        });
        let tokens = Arc::new(RotatingTokens {
            issued: Mutex::new(vec!["ya29.expired", "ya29.fresh"]),
            invalidations: Default::default(),
        });
        let fetcher = fetcher_for(serve(gmail.clone()).await, tokens.clone());

        let message = fetcher
            .fetch_message(&notification(100, Some("pinned")))
            .await
            .unwrap();

        assert_eq!(message.message_id.as_str(), "pinned");
        assert_eq!(
            tokens.invalidations.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(gmail.requests_to("messages/pinned").len(), 2);
    }

    #[tokio::test]
    async fn persistently_rejected_token_is_an_auth_failure() {
        let gmail = Arc::new(FakeGmail {
            messages: HashMap::from([("pinned", CI_SUBJECT)]),
            rejected_tokens: vec!["ya29.revoked"],
            ..FakeGmail::default()
        });
        let fetcher = fetcher_for(
            serve(gmail.clone()).await,
            Arc::new(StaticToken::new(SecretString::from("ya29.revoked".to_string()))),
        );

        let result = fetcher.fetch(&notification(100, Some("pinned"))).await;

        assert!(matches!(result, Err(GmailError::Unauthorized { status: 401, .. })));
        assert_eq!(gmail.requests_to("messages/pinned").len(), 2);
    }

    #[tokio::test]
    async fn processed_message_loses_unread_label() {
        let gmail = Arc::new(FakeGmail::default());
        let fetcher = fetcher(serve(gmail.clone()).await);

        fetcher
            .mark_processed(&notification(100, None), &MessageId::new("ci-1234").unwrap())
            .await
            .unwrap();

        let modified = gmail.modified.lock().unwrap().clone();
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].0, "ci-1234");
        assert_eq!(modified[0].1, serde_json::json!({ "removeLabelIds": ["UNREAD"] }));
    }

    #[tokio::test]
    async fn marking_read_can_be_disabled() {
        let gmail = Arc::new(FakeGmail::default());
        let config = GmailConfig {
            api_base: serve(gmail.clone()).await,
            mark_read: false,
            ..GmailConfig::default()
        };
        let fetcher = GmailMessageFetcher::new(
            config,
            Arc::new(StaticToken::new(SecretString::from("ya29.valid".to_string()))),
        )
        .unwrap();

        fetcher
            .mark_processed(&notification(100, None), &MessageId::new("ci-1234").unwrap())
            .await
            .unwrap();

        assert!(gmail.modified.lock().unwrap().is_empty());
    }
}
