//! Domain-side configuration for the dispatch pipeline.
//!
//! Every setting has a default so tests and the composition root only spell
//! out what differs. Secrets are not part of these types; the signature secret
//! is handed to [`crate::OriginAuthenticator::new`] directly.

use std::time::Duration;

use crate::{ConfigError, RepositoryId};

/// Subject substring that identifies CI/CD completion emails by default.
pub const DEFAULT_SUBJECT_FILTER: &str = "TheRock Pipeline";

/// Body keys forwarded to the downstream job by default.
pub const DEFAULT_JOB_PARAMETER_KEYS: [&str; 4] =
    ["PLATFORM", "S3_BUCKET_URL", "gpuArchPattern", "THEROCK_WHL_URL"];

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Origin signature checking.
    pub signature: SignatureConfig,
    /// Per-origin rate limiting.
    pub rate_limit: RateLimitConfig,
    /// Duplicate-suppression retention.
    pub retention: RetentionConfig,
    /// Content validation.
    pub content: ContentConfig,
}

impl PipelineConfig {
    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.max_requests == 0 {
            return Err(ConfigError::MustBePositive { setting: "rate_limit.max_requests" });
        }
        if self.rate_limit.window.is_zero() {
            return Err(ConfigError::MustBePositive { setting: "rate_limit.window" });
        }
        if self.rate_limit.max_tracked_keys == 0 {
            return Err(ConfigError::MustBePositive { setting: "rate_limit.max_tracked_keys" });
        }
        if self.retention.horizon.is_zero() {
            return Err(ConfigError::MustBePositive { setting: "retention.horizon" });
        }
        if self.content.subject_filter.trim().is_empty() {
            return Err(ConfigError::EmptySubjectFilter);
        }
        let source = &self.content.source_verification;
        if source.enabled && source.repository.is_none() {
            return Err(ConfigError::MissingRepository);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// How inbound signatures are checked.
#[derive(Debug, Clone)]
pub struct SignatureConfig {
    /// Maximum distance between the signed timestamp header and arrival time.
    pub timestamp_tolerance: Duration,
    /// Reject requests that carry no timestamp header.
    pub require_timestamp: bool,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            timestamp_tolerance: Duration::from_secs(5 * 60),
            require_timestamp: false,
        }
    }
}

/// Sliding-window rate limiting per origin key.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Ceiling `N`: admitted requests per key within one window.
    pub max_requests: u32,
    /// Window length `W`.
    pub window: Duration,
    /// Upper bound on distinct origin keys tracked at once.
    ///
    /// A new key arriving at the cap forces a sweep; if the table is still
    /// full the request is rejected.
    pub max_tracked_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            window: Duration::from_secs(5 * 60),
            max_tracked_keys: 10_000,
        }
    }
}

/// How long claimed notification identifiers are remembered.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Minimum time a claim is kept before it may be evicted.
    pub horizon: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            horizon: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// What to do when source verification cannot reach a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InconclusivePolicy {
    /// Treat inconclusive as a rejection (fail-closed).
    #[default]
    Reject,
    /// Treat inconclusive as a match (fail-open).
    Accept,
}

/// Source-repository corroboration settings.
#[derive(Debug, Clone)]
pub struct SourceVerificationConfig {
    /// Whether corroboration runs at all.
    pub enabled: bool,
    /// Repository whose activity must corroborate the email.
    pub repository: Option<RepositoryId>,
    /// How far before the message time activity is searched for.
    pub lookback: Duration,
    /// Decision applied to an inconclusive verdict.
    pub inconclusive: InconclusivePolicy,
}

impl Default for SourceVerificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            repository: None,
            lookback: Duration::from_secs(24 * 60 * 60),
            inconclusive: InconclusivePolicy::Reject,
        }
    }
}

/// Content validation settings.
#[derive(Debug, Clone)]
pub struct ContentConfig {
    /// Case-insensitive substring the subject must contain.
    pub subject_filter: String,
    /// Custom build-number pattern with one capture group, replacing the
    /// built-in patterns.
    pub build_number_pattern: Option<String>,
    /// `KEY: value` body entries forwarded to the job.
    pub job_parameter_keys: Vec<String>,
    /// Source-repository corroboration.
    pub source_verification: SourceVerificationConfig,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            subject_filter: DEFAULT_SUBJECT_FILTER.to_string(),
            build_number_pattern: None,
            job_parameter_keys: DEFAULT_JOB_PARAMETER_KEYS.iter().map(|k| k.to_string()).collect(),
            source_verification: SourceVerificationConfig::default(),
        }
    }
}
