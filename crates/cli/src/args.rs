//! Command-line and environment configuration.
//!
//! Every option can be given as a flag or through the environment variable
//! named next to it, so the relay deploys with the same variables as before.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gmail::{
    GmailConfig, ServiceAccountKey, DEFAULT_GMAIL_API_BASE, GMAIL_MODIFY_SCOPE,
    GMAIL_READONLY_SCOPE,
};
use github::{GitHubConfig, DEFAULT_GITHUB_API_BASE};
use jenkins::JenkinsConfig;
use listener::ListenerConfig;
use pipeline::{
    ContentConfig, InconclusivePolicy, PipelineConfig, RateLimitConfig, RepositoryId,
    RetentionConfig, SignatureConfig, SourceVerificationConfig, DEFAULT_SUBJECT_FILTER,
};
use secrecy::SecretString;

#[derive(Parser, Debug)]
#[command(name = "gmail-relay")]
#[command(about = "Relays Gmail push notifications for CI completion emails to Jenkins")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the webhook server.
    Serve(ServeArgs),
    /// Print a signed synthetic push request for manual testing.
    Sample(SampleArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum InconclusiveArg {
    Reject,
    Accept,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// IP address to bind.
    #[arg(long, env = "WEBHOOK_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Pre-shared secret for the X-Webhook-Signature header.
    #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// Reject requests without an X-Webhook-Timestamp header.
    #[arg(long, env = "REQUIRE_SIGNATURE_TIMESTAMP")]
    pub require_signature_timestamp: bool,

    #[arg(long, env = "SIGNATURE_TOLERANCE_SECS", default_value_t = 300)]
    pub signature_tolerance_secs: u64,

    #[arg(long, env = "EMAIL_SUBJECT_FILTER", default_value = DEFAULT_SUBJECT_FILTER)]
    pub subject_filter: String,

    /// Custom build-number regex with one capture group.
    #[arg(long, env = "BUILD_NUMBER_PATTERN")]
    pub build_number_pattern: Option<String>,

    /// Body keys forwarded to the job, comma separated.
    #[arg(
        long,
        env = "JOB_PARAMETER_KEYS",
        value_delimiter = ',',
        default_value = "PLATFORM,S3_BUCKET_URL,gpuArchPattern,THEROCK_WHL_URL"
    )]
    pub job_parameter_keys: Vec<String>,

    /// Requests admitted per origin per window.
    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS", default_value_t = 20)]
    pub rate_limit_max_requests: u32,

    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value_t = 300)]
    pub rate_limit_window_secs: u64,

    #[arg(long, env = "RATE_LIMIT_MAX_ORIGINS", default_value_t = 10_000)]
    pub rate_limit_max_origins: usize,

    /// How long handled notifications are remembered.
    #[arg(long, env = "DEDUP_RETENTION_SECS", default_value_t = 86_400)]
    pub dedup_retention_secs: u64,

    /// Use the first X-Forwarded-For entry as the origin key.
    #[arg(long, env = "TRUST_FORWARDED_FOR")]
    pub trust_forwarded_for: bool,

    #[arg(long, env = "RUN_DEADLINE_SECS", default_value_t = 10)]
    pub run_deadline_secs: u64,

    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Token for POST /test. The route is disabled without one.
    #[arg(long, env = "TEST_ENDPOINT_TOKEN", hide_env_values = true)]
    pub test_token: Option<String>,

    /// Service-account JSON key with domain-wide delegation for the mailbox.
    #[arg(long, env = "GOOGLE_CREDENTIALS_FILE")]
    pub google_credentials_file: Option<PathBuf>,

    /// Mailbox the service account acts as.
    #[arg(long, env = "GMAIL_USER_EMAIL")]
    pub gmail_user_email: Option<String>,

    /// Pre-minted OAuth access token, used instead of a credentials file.
    /// It is never refreshed.
    #[arg(long, env = "GMAIL_ACCESS_TOKEN", hide_env_values = true)]
    pub gmail_access_token: Option<String>,

    #[arg(long, env = "GMAIL_API_BASE", default_value = DEFAULT_GMAIL_API_BASE)]
    pub gmail_api_base: String,

    /// Unread messages examined when history names no new message.
    #[arg(long, env = "GMAIL_MAX_CANDIDATES", default_value_t = 5)]
    pub gmail_max_candidates: u32,

    /// Remove the UNREAD label from dispatched messages (needs gmail.modify).
    #[arg(
        long,
        env = "GMAIL_MARK_READ",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub gmail_mark_read: bool,

    #[arg(long, env = "JENKINS_URL")]
    pub jenkins_url: Option<String>,

    #[arg(long, env = "JENKINS_JOB")]
    pub jenkins_job: Option<String>,

    #[arg(long, env = "JENKINS_USER")]
    pub jenkins_user: Option<String>,

    #[arg(long, env = "JENKINS_API_TOKEN", hide_env_values = true)]
    pub jenkins_api_token: Option<String>,

    /// Corroborate emails against recent commits on the repository.
    #[arg(long, env = "ENABLE_GITHUB_VERIFICATION")]
    pub enable_github_verification: bool,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    #[arg(long, env = "GITHUB_REPOSITORY", default_value = "ROCm/TheRock")]
    pub github_repository: String,

    #[arg(long, env = "GITHUB_API_BASE", default_value = DEFAULT_GITHUB_API_BASE)]
    pub github_api_base: String,

    #[arg(long, env = "GITHUB_LOOKBACK_SECS", default_value_t = 86_400)]
    pub github_lookback_secs: u64,

    /// What to do when the repository cannot be queried.
    #[arg(long, env = "GITHUB_INCONCLUSIVE_POLICY", value_enum, default_value_t = InconclusiveArg::Reject)]
    pub github_inconclusive: InconclusiveArg,

    /// Outbound HTTP timeout for Gmail, GitHub and Jenkins calls.
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 10)]
    pub upstream_timeout_secs: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// OTLP gRPC endpoint; traces are exported when set.
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

#[derive(Args, Debug)]
pub struct SampleArgs {
    #[arg(long, env = "WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: String,

    #[arg(long, env = "GMAIL_USER_EMAIL")]
    pub mailbox: String,

    #[arg(long)]
    pub history_id: u64,

    /// Pin the notification to one message.
    #[arg(long)]
    pub message_id: Option<String>,

    /// Also sign an X-Webhook-Timestamp header.
    #[arg(long)]
    pub timestamped: bool,
}

/// How Gmail requests are authorized.
pub enum GmailAuth {
    /// Delegated service-account tokens, refreshed as they expire.
    ServiceAccount {
        key: ServiceAccountKey,
        subject: String,
        scope: &'static str,
    },
    /// A fixed token.
    Static(SecretString),
}

/// Fully validated runtime settings.
pub struct RelaySettings {
    pub bind: SocketAddr,
    pub webhook_secret: SecretString,
    pub pipeline: PipelineConfig,
    pub listener: ListenerConfig,
    pub gmail: GmailConfig,
    pub gmail_auth: GmailAuth,
    pub jenkins: JenkinsConfig,
    pub github: Option<GitHubConfig>,
    pub sweep_interval: Duration,
}

fn required(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

impl ServeArgs {
    /// Names of required settings that are absent, in the order they are documented.
    pub fn missing_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if required(&self.webhook_secret).is_none() {
            missing.push("WEBHOOK_SECRET");
        }
        match (&self.google_credentials_file, required(&self.gmail_access_token)) {
            (Some(_), _) => {
                if required(&self.gmail_user_email).is_none() {
                    missing.push("GMAIL_USER_EMAIL (required with GOOGLE_CREDENTIALS_FILE)");
                }
            }
            (None, Some(_)) => {}
            (None, None) => missing.push("GOOGLE_CREDENTIALS_FILE (or GMAIL_ACCESS_TOKEN)"),
        }
        if required(&self.jenkins_url).is_none() {
            missing.push("JENKINS_URL");
        }
        if required(&self.jenkins_job).is_none() {
            missing.push("JENKINS_JOB");
        }
        if required(&self.jenkins_user).is_none() {
            missing.push("JENKINS_USER");
        }
        if required(&self.jenkins_api_token).is_none() {
            missing.push("JENKINS_API_TOKEN");
        }
        if self.enable_github_verification && required(&self.github_token).is_none() {
            missing.push("GITHUB_TOKEN (required when ENABLE_GITHUB_VERIFICATION is true)");
        }
        missing
    }

    /// Validates the arguments and builds typed settings.
    ///
    /// # Errors
    ///
    /// Fails listing every missing required setting, or on the first
    /// malformed value.
    pub fn into_settings(self) -> anyhow::Result<RelaySettings> {
        let missing = self.missing_settings();
        if !missing.is_empty() {
            bail!("missing required configuration: {}", missing.join(", "));
        }
        let secret = |value: &Option<String>| {
            SecretString::from(required(value).unwrap_or_default().to_string())
        };
        let text = |value: &Option<String>| required(value).unwrap_or_default().to_string();

        let bind: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))?;

        let repository = RepositoryId::new(self.github_repository.as_str())
            .filter(|r| r.owner_and_name().is_some());
        if self.enable_github_verification && repository.is_none() {
            bail!(
                "GITHUB_REPOSITORY must look like owner/name, got {:?}",
                self.github_repository
            );
        }

        let upstream_timeout = Duration::from_secs(self.upstream_timeout_secs);
        let pipeline = PipelineConfig {
            signature: SignatureConfig {
                timestamp_tolerance: Duration::from_secs(self.signature_tolerance_secs),
                require_timestamp: self.require_signature_timestamp,
            },
            rate_limit: RateLimitConfig {
                max_requests: self.rate_limit_max_requests,
                window: Duration::from_secs(self.rate_limit_window_secs),
                max_tracked_keys: self.rate_limit_max_origins,
            },
            retention: RetentionConfig {
                horizon: Duration::from_secs(self.dedup_retention_secs),
            },
            content: ContentConfig {
                subject_filter: self.subject_filter.clone(),
                build_number_pattern: self.build_number_pattern.clone(),
                job_parameter_keys: self
                    .job_parameter_keys
                    .iter()
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect(),
                source_verification: SourceVerificationConfig {
                    enabled: self.enable_github_verification,
                    repository,
                    lookback: Duration::from_secs(self.github_lookback_secs),
                    inconclusive: match self.github_inconclusive {
                        InconclusiveArg::Reject => InconclusivePolicy::Reject,
                        InconclusiveArg::Accept => InconclusivePolicy::Accept,
                    },
                },
            },
        };
        pipeline.validate().context("invalid pipeline configuration")?;

        let gmail_auth = match &self.google_credentials_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let key = ServiceAccountKey::from_json(&raw)
                    .with_context(|| format!("invalid credentials in {}", path.display()))?;
                GmailAuth::ServiceAccount {
                    key,
                    subject: text(&self.gmail_user_email),
                    scope: if self.gmail_mark_read {
                        GMAIL_MODIFY_SCOPE
                    } else {
                        GMAIL_READONLY_SCOPE
                    },
                }
            }
            None => GmailAuth::Static(secret(&self.gmail_access_token)),
        };

        let github = self.enable_github_verification.then(|| GitHubConfig {
            api_base: self.github_api_base.clone(),
            token: secret(&self.github_token),
            timeout: upstream_timeout,
        });

        Ok(RelaySettings {
            bind,
            webhook_secret: secret(&self.webhook_secret),
            listener: ListenerConfig {
                trust_forwarded_for: self.trust_forwarded_for,
                run_deadline: Duration::from_secs(self.run_deadline_secs),
                test_token: required(&self.test_token).map(|t| SecretString::from(t.to_string())),
                ..ListenerConfig::default()
            },
            gmail: GmailConfig {
                api_base: self.gmail_api_base.clone(),
                timeout: upstream_timeout,
                max_candidates: self.gmail_max_candidates,
                subject_hint: Some(self.subject_filter.clone()),
                mark_read: self.gmail_mark_read,
            },
            gmail_auth,
            jenkins: JenkinsConfig {
                base_url: text(&self.jenkins_url),
                job: text(&self.jenkins_job),
                user: text(&self.jenkins_user),
                token: secret(&self.jenkins_api_token),
                timeout: upstream_timeout,
            },
            github,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            pipeline,
        })
    }
}
