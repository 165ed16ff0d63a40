//! GitHub source verification adapter.
//!
//! Implements [`pipeline::ActivityVerifier`] by listing recent commits on the
//! configured repository. Every transport, status or parse failure becomes
//! [`pipeline::ActivityVerdict::Inconclusive`]; the dispatcher decides what an
//! inconclusive verdict means.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules.
//! GitHub API details (headers, authentication, pagination limits) are handled
//! here; the [`pipeline`] crate never sees them.

mod error;
mod verifier;

pub use error::GitHubError;
pub use verifier::{matches_activity, GitHubConfig, GitHubActivityVerifier, DEFAULT_GITHUB_API_BASE};
