//! [`ActivityVerifier`] backed by the GitHub commits API.
//!
//! An email is corroborated when the repository saw a commit inside the
//! lookback window, or a commit matching the extracted SHA prefix when there is
//! one. Transport and status failures are inconclusive, never a rejection.

use std::time::Duration;

use async_trait::async_trait;
use pipeline::{ActivityQuery, ActivityVerdict, ActivityVerifier, CommitSha};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::GitHubError;

/// Public GitHub REST endpoint.
pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";

const USER_AGENT: &str = "gmail-relay/source-verifier";
const PER_PAGE: &str = "10";

/// Connection settings for [`GitHubActivityVerifier`].
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    /// API base URL.
    pub api_base: String,
    /// Token with read access to the repository.
    pub token: SecretString,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl GitHubConfig {
    /// Config for the public API endpoint.
    pub fn new(token: SecretString) -> Self {
        Self {
            api_base: DEFAULT_GITHUB_API_BASE.to_string(),
            token,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommitSummary {
    sha: String,
}

/// [`ActivityVerifier`] backed by `GET /repos/{owner}/{repo}/commits`.
pub struct GitHubActivityVerifier {
    client: Client,
    config: GitHubConfig,
}

impl GitHubActivityVerifier {
    /// Builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`GitHubError::Http`] if the client cannot be constructed.
    pub fn new(config: GitHubConfig) -> Result<Self, GitHubError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn list_commits(&self, query: &ActivityQuery) -> Result<Vec<CommitSummary>, GitHubError> {
        let since = query.around.checked_sub(query.lookback).unwrap_or(query.around);
        let endpoint = format!(
            "{}/repos/{}/commits",
            self.config.api_base.trim_end_matches('/'),
            query.repository
        );

        let response = self
            .client
            .get(endpoint)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", "2022-11-28")
            .bearer_auth(self.config.token.expose_secret())
            .query(&[
                ("since", since.to_string()),
                ("until", query.around.to_string()),
                ("per_page", PER_PAGE.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GitHubError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| GitHubError::Parse(e.to_string()))
    }
}

/// Decides whether listed commit SHAs corroborate an email.
///
/// Without a commit reference any recent commit counts; with one, some commit
/// must start with it (case-insensitive).
pub fn matches_activity<'a>(
    shas: impl IntoIterator<Item = &'a str>,
    commit: Option<&CommitSha>,
) -> bool {
    let mut shas = shas.into_iter();
    match commit {
        None => shas.next().is_some(),
        Some(prefix) => {
            let prefix = prefix.as_str().to_ascii_lowercase();
            shas.any(|sha| sha.to_ascii_lowercase().starts_with(&prefix))
        }
    }
}

#[async_trait]
impl ActivityVerifier for GitHubActivityVerifier {
    async fn verify_recent_activity(&self, query: &ActivityQuery) -> ActivityVerdict {
        match self.list_commits(query).await {
            Ok(commits) => {
                let matched = matches_activity(
                    commits.iter().map(|c| c.sha.as_str()),
                    query.commit.as_ref(),
                );
                tracing::info!(
                    repository = %query.repository,
                    commits = commits.len(),
                    commit = query.commit.as_ref().map(CommitSha::as_str).unwrap_or(""),
                    matched,
                    "checked recent repository activity"
                );
                if matched {
                    ActivityVerdict::Matched
                } else {
                    ActivityVerdict::NotMatched
                }
            }
            Err(e) => {
                tracing::warn!(
                    repository = %query.repository,
                    error = %e,
                    "repository activity check failed"
                );
                ActivityVerdict::Inconclusive
            }
        }
    }
}
