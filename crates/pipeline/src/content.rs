//! Content validation for fetched CI/CD completion emails.
//!
//! Checks run in order and stop at the first failure:
//!
//! 1. The subject contains the configured filter (case-insensitive).
//! 2. A build number can be extracted from the subject, or failing that the body.
//! 3. When enabled, the source repository shows activity that corroborates the
//!    email. A verifier that cannot reach a verdict yields
//!    [`ValidationOutcome::SourceInconclusive`]; the dispatcher applies the
//!    configured [`crate::InconclusivePolicy`].

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use crate::{
    ActivityQuery, ActivityVerdict, ActivityVerifier, BuildNumber, CommitSha, ConfigError,
    ContentConfig, DecodedNotification, FetchedMessage,
};

/// Build-number patterns tried in order when no custom pattern is configured.
const BUILD_NUMBER_PATTERNS: [&str; 5] = [
    r"Build\s+#?(\d+)",
    r"build\s+number[:\s]+(\d+)",
    r"Pipeline\s+#?(\d+)",
    r"Job\s+#?(\d+)",
    r"\bbuild[:\s]+(\d+)",
];

const COMMIT_PATTERN: &str = r"\bcommit[:\s#]+([0-9a-f]{7,40})\b";

/// What an accepted email contributes to the job request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedContent {
    /// Extracted build number.
    pub build_number: BuildNumber,
    /// Commit named by the email, if any.
    pub commit: Option<CommitSha>,
    /// `KEY: value` parameters found in the body.
    pub parameters: BTreeMap<String, String>,
}

/// Result of [`ContentValidator::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// All checks passed.
    Accepted(AcceptedContent),
    /// The subject does not contain the filter.
    RejectedSubject,
    /// No build number could be extracted.
    RejectedBuildNumber,
    /// The repository showed no corroborating activity.
    RejectedSourceMismatch,
    /// The repository could not be queried. Carries the content that would
    /// otherwise have been accepted so a fail-open policy can still proceed.
    SourceInconclusive(AcceptedContent),
}

/// Decides whether a fetched message is a genuine CI/CD completion email.
pub struct ContentValidator {
    config: ContentConfig,
    subject_filter: String,
    build_patterns: Vec<Regex>,
    commit_pattern: Regex,
    parameter_patterns: Vec<(String, Regex)>,
    verifier: Option<Arc<dyn ActivityVerifier>>,
}

impl std::fmt::Debug for ContentValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentValidator")
            .field("config", &self.config)
            .field("verifier", &self.verifier.is_some())
            .finish_non_exhaustive()
    }
}

impl ContentValidator {
    /// Compiles the configured patterns.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidPattern`] if a custom build-number pattern does
    ///   not compile or has no capture group.
    /// - [`ConfigError::MissingVerifier`] if source verification is enabled and
    ///   `verifier` is `None`.
    /// - [`ConfigError::InvalidParameterKey`] for an empty or spaced key.
    pub fn new(
        config: ContentConfig,
        verifier: Option<Arc<dyn ActivityVerifier>>,
    ) -> Result<Self, ConfigError> {
        if config.subject_filter.trim().is_empty() {
            return Err(ConfigError::EmptySubjectFilter);
        }
        if config.source_verification.enabled {
            if verifier.is_none() {
                return Err(ConfigError::MissingVerifier);
            }
            if config.source_verification.repository.is_none() {
                return Err(ConfigError::MissingRepository);
            }
        }

        let build_patterns = match &config.build_number_pattern {
            Some(custom) => {
                let compiled = compile(custom)?;
                if compiled.captures_len() < 2 {
                    return Err(ConfigError::InvalidPattern {
                        pattern: custom.clone(),
                        reason: "pattern needs a capture group for the number".into(),
                    });
                }
                vec![compiled]
            }
            None => BUILD_NUMBER_PATTERNS
                .iter()
                .map(|p| compile(p))
                .collect::<Result<_, _>>()?,
        };

        let parameter_patterns = config
            .job_parameter_keys
            .iter()
            .map(|key| {
                if key.is_empty() || key.chars().any(char::is_whitespace) {
                    return Err(ConfigError::InvalidParameterKey(key.clone()));
                }
                let pattern = format!(r#"\b{}:\s*"?([^"\s]+)"?"#, regex::escape(key));
                let regex = Regex::new(&pattern).map_err(|e| ConfigError::InvalidPattern {
                    pattern,
                    reason: e.to_string(),
                })?;
                Ok((key.clone(), regex))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            subject_filter: config.subject_filter.to_lowercase(),
            build_patterns,
            commit_pattern: compile(COMMIT_PATTERN)?,
            parameter_patterns,
            verifier,
            config,
        })
    }

    /// Runs the content checks against `message`.
    pub async fn validate(
        &self,
        decoded: &DecodedNotification,
        message: &FetchedMessage,
    ) -> ValidationOutcome {
        if !message.subject.to_lowercase().contains(&self.subject_filter) {
            return ValidationOutcome::RejectedSubject;
        }

        let Some(build_number) = self.extract_build_number(&message.subject, &message.body)
        else {
            return ValidationOutcome::RejectedBuildNumber;
        };

        let content = AcceptedContent {
            build_number,
            commit: message.commit.clone().or_else(|| self.extract_commit(&message.body)),
            parameters: self.extract_parameters(&message.body),
        };

        let source = &self.config.source_verification;
        let (Some(verifier), Some(repository), true) =
            (&self.verifier, &source.repository, source.enabled)
        else {
            return ValidationOutcome::Accepted(content);
        };

        let query = ActivityQuery {
            repository: repository.clone(),
            around: message.received_at.unwrap_or(decoded.received_at),
            lookback: source.lookback,
            commit: content.commit.clone(),
        };
        match verifier.verify_recent_activity(&query).await {
            ActivityVerdict::Matched => ValidationOutcome::Accepted(content),
            ActivityVerdict::NotMatched => ValidationOutcome::RejectedSourceMismatch,
            ActivityVerdict::Inconclusive => ValidationOutcome::SourceInconclusive(content),
        }
    }

    /// Extracts a build number from the subject, falling back to the body.
    pub fn extract_build_number(&self, subject: &str, body: &str) -> Option<BuildNumber> {
        [subject, body].into_iter().find_map(|text| {
            self.build_patterns.iter().find_map(|pattern| {
                pattern
                    .captures(text)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse().ok())
                    .map(BuildNumber::new)
            })
        })
    }

    /// Extracts the configured `KEY: value` parameters from `body`.
    pub fn extract_parameters(&self, body: &str) -> BTreeMap<String, String> {
        self.parameter_patterns
            .iter()
            .filter_map(|(key, pattern)| {
                let value = pattern.captures(body)?.get(1)?.as_str().to_string();
                Some((key.clone(), value))
            })
            .collect()
    }

    fn extract_commit(&self, body: &str) -> Option<CommitSha> {
        self.commit_pattern
            .captures(body)
            .and_then(|c| c.get(1))
            .and_then(|m| CommitSha::new(m.as_str()))
    }
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}
