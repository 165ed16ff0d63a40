//! Gmail message fetch adapter.
//!
//! Implements [`pipeline::MessageFetcher`] over the Gmail REST API: the
//! notification is resolved to the message that caused it, which is fetched in
//! full and reduced to subject, sender and plain-text body. Dispatched messages
//! lose their `UNREAD` label.
//!
//! Requests are authorized by an [`AccessTokenSource`], normally a
//! [`ServiceAccountTokenSource`] that keeps a delegated token fresh.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, request formatting and MIME walking live
//! here. The [`pipeline`] crate sees only [`pipeline::MessageFetcher`].

mod auth;
mod error;
mod fetcher;
mod message;

pub use auth::{
    AccessTokenSource, ServiceAccountKey, ServiceAccountTokenSource, StaticToken,
    GMAIL_MODIFY_SCOPE, GMAIL_READONLY_SCOPE,
};
pub use error::GmailError;
pub use fetcher::{GmailConfig, GmailMessageFetcher, DEFAULT_GMAIL_API_BASE};
