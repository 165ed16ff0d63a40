//! Core domain for the Gmail push relay.
//!
//! This crate contains every domain concept, newtype identifier, value type,
//! error type and gate used by the dispatch pipeline. Infrastructure crates
//! implement the port traits defined here; they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no network I/O.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`MailboxId`, `HistoryId`, `NotificationKey`, etc.) |
//! | [`types`] | Value types (`Timestamp`, `InboundEvent`, `FetchedMessage`, `JobRequest`) |
//! | [`errors`] | Error and retry-policy types |
//! | [`config`] | Pipeline configuration with defaults |
//! | [`auth`] | Origin Authenticator (HMAC-SHA256 signatures) |
//! | [`rate_limit`] | Rate Limiter (sliding window per origin key) |
//! | [`dedup`] | Duplicate Suppressor (atomic claim registry) |
//! | [`decode`] | Push-envelope decoding |
//! | [`content`] | Content Validator |
//! | [`ports`] | Collaborator traits: message fetch, activity verification, job trigger |
//! | [`outcome`] | Terminal states and dispatch results |

pub mod auth;
pub mod config;
pub mod content;
pub mod decode;
pub mod dedup;
pub mod errors;
pub mod identifiers;
pub mod outcome;
pub mod ports;
pub mod rate_limit;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use auth::{constant_time_eq, AuthFailure, OriginAuthenticator, SIGNATURE_HEADER, TIMESTAMP_HEADER};
pub use config::{
    ContentConfig, InconclusivePolicy, PipelineConfig, RateLimitConfig, RetentionConfig,
    SignatureConfig, SourceVerificationConfig, DEFAULT_JOB_PARAMETER_KEYS, DEFAULT_SUBJECT_FILTER,
};
pub use content::{AcceptedContent, ContentValidator, ValidationOutcome};
pub use decode::{decode_notification, NotificationPayload};
pub use dedup::{ClaimRegistry, InMemorySeenSet};
pub use errors::{ConfigError, DecodeError, FetchError, RetryPolicy, TriggerError};
pub use identifiers::{
    BuildNumber, CommitSha, HistoryId, MailboxId, MessageId, NotificationKey, OriginKey,
    RepositoryId, RunId,
};
pub use outcome::{
    ContentRejection, DispatchOutcome, DispatchResult, PipelineState, Rejection, UpstreamFailure,
    UpstreamStage,
};
pub use ports::{ActivityQuery, ActivityVerdict, ActivityVerifier, JobTrigger, MessageFetcher};
pub use rate_limit::{RateLimited, RateLimiter, SlidingWindowRateLimiter};
pub use types::{
    DecodedNotification, FetchedMessage, InboundEvent, InboundHeaders, JobHandle, JobRequest,
    Timestamp,
};
