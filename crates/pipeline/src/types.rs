//! Shared value types for the relay domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! the data that flows through a pipeline run: the raw inbound event, its
//! decoded form, the fetched message, and the job request handed to the
//! trigger collaborator.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{BuildNumber, CommitSha, HistoryId, MailboxId, MessageId, NotificationKey, OriginKey, RunId};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Creates a [`Timestamp`] from whole seconds since the Unix epoch.
    ///
    /// Returns `None` if the value is out of the representable range.
    pub fn from_unix_seconds(secs: i64) -> Option<Self> {
        DateTime::<Utc>::from_timestamp(secs, 0).map(Self)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Returns `self - duration`, or `None` on overflow.
    pub fn checked_sub(self, duration: Duration) -> Option<Self> {
        let delta = TimeDelta::from_std(duration).ok()?;
        self.0.checked_sub_signed(delta).map(Self)
    }

    /// Returns `self + duration`, or `None` on overflow.
    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        let delta = TimeDelta::from_std(duration).ok()?;
        self.0.checked_add_signed(delta).map(Self)
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or(Duration::ZERO)
    }

    /// Absolute distance between two timestamps.
    pub fn abs_diff(self, other: Timestamp) -> Duration {
        if self >= other {
            self.saturating_duration_since(other)
        } else {
            other.saturating_duration_since(self)
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Inbound event
// ---------------------------------------------------------------------------

/// Request headers relevant to the pipeline, keyed by lowercase name.
///
/// Kept transport-agnostic so this crate does not depend on an HTTP library;
/// the listener copies the headers it receives into this map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundHeaders(BTreeMap<String, String>);

impl InboundHeaders {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any previous value with the same name.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Returns the value of `name` (case-insensitive), if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Returns `true` if no headers are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for InboundHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// A raw inbound webhook call, exactly as received.
///
/// Immutable once constructed; one per HTTP call.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Raw request body bytes. Signatures are computed over these exact bytes.
    pub body: Vec<u8>,
    /// Request headers, including the signature header.
    pub headers: InboundHeaders,
    /// Rate-limit bucket for this request.
    pub origin: OriginKey,
    /// When the request arrived.
    pub received_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Decoded notification and fetched message
// ---------------------------------------------------------------------------

/// The push notification after the envelope has been decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedNotification {
    /// Mailbox that received the new message.
    pub mailbox: MailboxId,
    /// History position the notification refers to.
    pub history_id: HistoryId,
    /// Message id, when the envelope already carries one (synthetic payloads).
    pub message_id: Option<MessageId>,
    /// Transport publish time when present, otherwise arrival time.
    pub received_at: Timestamp,
}

impl DecodedNotification {
    /// The identifier this notification is claimed under.
    pub fn key(&self) -> NotificationKey {
        match &self.message_id {
            Some(message) => NotificationKey::Message {
                mailbox: self.mailbox.clone(),
                message: message.clone(),
            },
            None => NotificationKey::History {
                mailbox: self.mailbox.clone(),
                history: self.history_id,
            },
        }
    }
}

/// A message as returned by the message-fetch collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    /// Mailbox-assigned id of the fetched message.
    pub message_id: MessageId,
    /// `Subject` header value.
    pub subject: String,
    /// `From` header value, when present.
    pub sender: Option<String>,
    /// Plain-text body, or the snippet when no plain-text part exists.
    pub body: String,
    /// Commit reference, when the fetcher could determine one.
    pub commit: Option<CommitSha>,
    /// When the mailbox received the message, when known.
    pub received_at: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// Job trigger
// ---------------------------------------------------------------------------

/// Everything the job-trigger collaborator needs to start one downstream run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Pipeline run that produced this request.
    pub run_id: RunId,
    /// Claimed notification identifier.
    pub notification: NotificationKey,
    /// Message the build number was extracted from.
    pub message_id: MessageId,
    /// Subject of that message, for the downstream job's audit trail.
    pub subject: String,
    /// Build number extracted from the message.
    pub build_number: BuildNumber,
    /// Extra `KEY: value` parameters extracted from the message body.
    pub parameters: BTreeMap<String, String>,
}

/// Receipt returned by the job-trigger collaborator on success.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobHandle {
    /// Location of the queued job, when the collaborator reports one.
    pub queue_url: Option<String>,
}
