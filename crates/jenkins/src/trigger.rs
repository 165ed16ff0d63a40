//! [`JobTrigger`] over Jenkins' `buildWithParameters` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use pipeline::{JobHandle, JobRequest, JobTrigger, TriggerError};
use reqwest::{redirect, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::JenkinsError;

/// Form field carrying the build number extracted from the email. Distinct
/// from Jenkins' own `BUILD_NUMBER` environment variable.
pub const BUILD_NUMBER_PARAM: &str = "SOURCE_BUILD_NUMBER";

/// Connection settings for [`JenkinsJobTrigger`].
#[derive(Debug, Clone)]
pub struct JenkinsConfig {
    /// Server root, e.g. `https://ci.example.com`.
    pub base_url: String,
    /// Job name; folders are separated by `/`.
    pub job: String,
    /// User the API token belongs to.
    pub user: String,
    /// API token.
    pub token: SecretString,
    /// Per-request timeout.
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Crumb {
    crumb_request_field: String,
    crumb: String,
}

/// [`JobTrigger`] that queues a parameterised Jenkins build.
pub struct JenkinsJobTrigger {
    client: Client,
    config: JenkinsConfig,
}

impl JenkinsJobTrigger {
    /// Builds the HTTP client. Redirects are not followed so a `302` answer
    /// can be recognised as success.
    ///
    /// # Errors
    ///
    /// Returns [`TriggerError::Transport`] if the client cannot be constructed.
    pub fn new(config: JenkinsConfig) -> Result<Self, TriggerError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(JenkinsError::from)?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn fetch_crumb(&self) -> Result<Crumb, JenkinsError> {
        let response = self
            .client
            .get(self.url("crumbIssuer/api/json"))
            .basic_auth(&self.config.user, Some(self.config.token.expose_secret()))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JenkinsError::from_status(status.as_u16(), &body));
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| JenkinsError::Parse(e.to_string()))
    }

    /// Crumb header, when the server issues one. CSRF protection may be
    /// disabled, so any failure here just means "no crumb".
    async fn crumb(&self) -> Option<Crumb> {
        match self.fetch_crumb().await {
            Ok(crumb) => Some(crumb),
            Err(e) => {
                tracing::debug!(error = %e, "no crumb issued");
                None
            }
        }
    }

    async fn queue_build(&self, request: &JobRequest) -> Result<JobHandle, JenkinsError> {
        let url = self.url(&format!("{}/buildWithParameters", job_path(&self.config.job)));

        let mut builder = self
            .client
            .post(url)
            .basic_auth(&self.config.user, Some(self.config.token.expose_secret()))
            .form(&build_form(request));
        if let Some(crumb) = self.crumb().await {
            builder = builder.header(crumb.crumb_request_field.as_str(), crumb.crumb.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if status != StatusCode::CREATED && status != StatusCode::FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(JenkinsError::from_status(status.as_u16(), &body));
        }
        let queue_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(JobHandle { queue_url })
    }
}

/// URL path of `job`, expanding folders (`team/build` → `job/team/job/build`).
pub fn job_path(job: &str) -> String {
    job.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| format!("job/{segment}"))
        .collect::<Vec<_>>()
        .join("/")
}

/// Form fields for `buildWithParameters`: the extracted parameters plus
/// [`BUILD_NUMBER_PARAM`].
pub fn build_form(request: &JobRequest) -> Vec<(String, String)> {
    let mut form: Vec<(String, String)> = request
        .parameters
        .iter()
        .filter(|(key, _)| key.as_str() != BUILD_NUMBER_PARAM)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    form.push((BUILD_NUMBER_PARAM.to_string(), request.build_number.to_string()));
    form
}

#[async_trait]
impl JobTrigger for JenkinsJobTrigger {
    async fn trigger_job(&self, request: &JobRequest) -> Result<JobHandle, TriggerError> {
        match self.queue_build(request).await {
            Ok(handle) => {
                tracing::info!(
                    job = %self.config.job,
                    build_number = %request.build_number,
                    queue_url = handle.queue_url.as_deref().unwrap_or(""),
                    "jenkins build queued"
                );
                Ok(handle)
            }
            Err(e) => {
                tracing::warn!(
                    job = %self.config.job,
                    build_number = %request.build_number,
                    error = %e,
                    "jenkins build request failed"
                );
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{header, HeaderMap};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use pipeline::{BuildNumber, MailboxId, MessageId, NotificationKey, RunId};

    use super::*;

    fn request(parameters: BTreeMap<String, String>) -> JobRequest {
        JobRequest {
            run_id: RunId::new_random(),
            notification: NotificationKey::History {
                mailbox: MailboxId::new("ci@example.com").unwrap(),
                history: pipeline::HistoryId::new(9),
            },
            message_id: MessageId::new("m1").unwrap(),
            subject: "TheRock Pipeline Build #77".into(),
            build_number: BuildNumber::new(77),
            parameters,
        }
    }

    fn config(base_url: String) -> JenkinsConfig {
        JenkinsConfig {
            base_url,
            job: "team/therock-ci".into(),
            user: "relay".into(),
            token: SecretString::from("t".to_string()),
            timeout: Duration::from_secs(2),
        }
    }

    /// In-process stand-in for a Jenkins controller.
    struct FakeJenkins {
        issue_crumb: bool,
        answer: StatusCode,
        answer_body: String,
        builds: Mutex<Vec<(HashMap<String, String>, Option<String>)>>,
    }

    impl FakeJenkins {
        fn answering(answer: StatusCode, answer_body: &str) -> Arc<Self> {
            Self::build(true, answer, answer_body)
        }

        fn without_crumb_issuer() -> Arc<Self> {
            Self::build(false, StatusCode::CREATED, "")
        }

        fn build(issue_crumb: bool, answer: StatusCode, answer_body: &str) -> Arc<Self> {
            Arc::new(Self {
                issue_crumb,
                answer,
                answer_body: answer_body.to_string(),
                builds: Mutex::new(Vec::new()),
            })
        }
    }

    async fn crumb_issuer(State(jenkins): State<Arc<FakeJenkins>>) -> Response {
        if !jenkins.issue_crumb {
            return StatusCode::NOT_FOUND.into_response();
        }
        Json(serde_json::json!({
            "_class": "hudson.security.csrf.DefaultCrumbIssuer",
            "crumb": "c0ffee",
            "crumbRequestField": "Jenkins-Crumb"
        }))
        .into_response()
    }

    async fn build_with_parameters(
        State(jenkins): State<Arc<FakeJenkins>>,
        headers: HeaderMap,
        Form(form): Form<HashMap<String, String>>,
    ) -> Response {
        let crumb = headers
            .get("jenkins-crumb")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        jenkins.builds.lock().unwrap().push((form, crumb));
        if jenkins.answer == StatusCode::CREATED {
            return (
                StatusCode::CREATED,
                [(header::LOCATION, "http://jenkins.local/queue/item/42/")],
            )
                .into_response();
        }
        (jenkins.answer, jenkins.answer_body.clone()).into_response()
    }

    async fn serve(jenkins: Arc<FakeJenkins>) -> String {
        let app = Router::new()
            .route("/crumbIssuer/api/json", get(crumb_issuer))
            .route(
                "/job/team/job/therock-ci/buildWithParameters",
                post(build_with_parameters),
            )
            .with_state(jenkins);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[test]
    fn form_carries_parameters_and_source_build_number() {
        let params = BTreeMap::from([
            ("PLATFORM".to_string(), "linux".to_string()),
            ("SOURCE_BUILD_NUMBER".to_string(), "spoofed".to_string()),
        ]);
        let form = build_form(&request(params));
        assert_eq!(
            form,
            vec![
                ("PLATFORM".to_string(), "linux".to_string()),
                ("SOURCE_BUILD_NUMBER".to_string(), "77".to_string()),
            ]
        );
        assert!(form.iter().all(|(key, _)| key != "BUILD_NUMBER"));
    }

    #[test]
    fn folder_jobs_expand_to_nested_paths() {
        assert_eq!(job_path("therock-ci"), "job/therock-ci");
        assert_eq!(job_path("team/nightly/"), "job/team/job/nightly");
    }

    #[tokio::test]
    async fn queued_build_returns_location_and_sends_crumb() {
        let jenkins = FakeJenkins::answering(StatusCode::CREATED, "");
        let trigger = JenkinsJobTrigger::new(config(serve(jenkins.clone()).await)).unwrap();
        let params = BTreeMap::from([("PLATFORM".to_string(), "linux".to_string())]);

        let handle = trigger.trigger_job(&request(params)).await.unwrap();

        assert_eq!(
            handle.queue_url.as_deref(),
            Some("http://jenkins.local/queue/item/42/")
        );
        let builds = jenkins.builds.lock().unwrap();
        assert_eq!(builds.len(), 1);
        let (form, crumb) = &builds[0];
        assert_eq!(form.get("PLATFORM").map(String::as_str), Some("linux"));
        assert_eq!(form.get(BUILD_NUMBER_PARAM).map(String::as_str), Some("77"));
        assert_eq!(crumb.as_deref(), Some("c0ffee"));
    }

    #[tokio::test]
    async fn missing_crumb_issuer_still_queues_the_build() {
        let jenkins = FakeJenkins::without_crumb_issuer();
        let trigger = JenkinsJobTrigger::new(config(serve(jenkins.clone()).await)).unwrap();

        trigger.trigger_job(&request(BTreeMap::new())).await.unwrap();

        assert_eq!(jenkins.builds.lock().unwrap()[0].1, None);
    }

    #[tokio::test]
    async fn forbidden_answer_is_unauthorized() {
        let jenkins = FakeJenkins::answering(StatusCode::FORBIDDEN, "No valid crumb");
        let trigger = JenkinsJobTrigger::new(config(serve(jenkins).await)).unwrap();

        let error = trigger.trigger_job(&request(BTreeMap::new())).await.unwrap_err();

        assert_eq!(error, TriggerError::Unauthorized { status: 403 });
        assert!(!error.retry_policy().is_retryable());
    }

    #[tokio::test]
    async fn error_page_is_truncated() {
        let page = format!("<html><body>{}</body></html>", "stack trace ".repeat(500));
        let jenkins = FakeJenkins::answering(StatusCode::INTERNAL_SERVER_ERROR, &page);
        let trigger = JenkinsJobTrigger::new(config(serve(jenkins).await)).unwrap();

        let error = trigger.trigger_job(&request(BTreeMap::new())).await.unwrap_err();

        let TriggerError::UnexpectedStatus { status, message } = &error else {
            panic!("expected UnexpectedStatus, got {error:?}");
        };
        assert_eq!(*status, 500);
        assert!(message.len() < page.len());
        assert!(message.ends_with("..."));
        assert!(error.retry_policy().is_retryable());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_retryable_transport_error() {
        let trigger = JenkinsJobTrigger::new(config("http://127.0.0.1:9".into())).unwrap();

        let error = trigger.trigger_job(&request(BTreeMap::new())).await.unwrap_err();
        assert!(matches!(error, TriggerError::Transport(_)));
        assert!(error.retry_policy().is_retryable());
    }
}
