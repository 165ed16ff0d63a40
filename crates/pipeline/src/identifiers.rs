//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example, a
//! [`HistoryId`] with a [`BuildNumber`] even though both are `u64` under the hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty
            /// or only whitespace.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.trim().is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for u64-wrapped newtypes (provider-assigned integers).
// Generates: struct (Copy), new(), as_u64(), Display.
// ---------------------------------------------------------------------------
macro_rules! u64_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new identifier from a raw integer.
            pub fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the underlying integer value.
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers — provider-integer-backed
// ---------------------------------------------------------------------------

u64_id! {
    /// Mailbox history position reported by a push notification.
    ///
    /// Stable across redeliveries of the same notification, which makes it a
    /// usable claim identifier when no message id is known yet.
    HistoryId
}

u64_id! {
    /// CI/CD build number extracted from a completion email.
    BuildNumber
}

// ---------------------------------------------------------------------------
// Identifiers — UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a single pipeline run (one inbound event from receipt to terminal state).
///
/// Generated fresh for every inbound event; propagated through spans and audit
/// events so all activity from a single run can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a new random run identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers — String-backed
// ---------------------------------------------------------------------------

string_id! {
    /// The monitored mailbox (an email address such as `"ci@example.com"`).
    MailboxId
}

string_id! {
    /// Mailbox-assigned identifier of a single message.
    MessageId
}

string_id! {
    /// Bucket key for rate limiting: a source IP or a transport subscription id.
    OriginKey
}

string_id! {
    /// Identifies a source repository in `"owner/repo"` format.
    RepositoryId
}

string_id! {
    /// A Git commit SHA or unambiguous SHA prefix.
    CommitSha
}

impl RepositoryId {
    /// Splits the identifier into `(owner, repo)`.
    ///
    /// Returns `None` unless the value has exactly one `/` with non-empty halves.
    pub fn owner_and_name(&self) -> Option<(&str, &str)> {
        let (owner, name) = self.0.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            None
        } else {
            Some((owner, name))
        }
    }
}

// ---------------------------------------------------------------------------
// Claim identifier
// ---------------------------------------------------------------------------

/// The identifier under which a notification is claimed in the duplicate
/// suppressor.
///
/// Uses the message id when the notification already carries one, and falls
/// back to the mailbox history id otherwise. Both variants are scoped to the
/// mailbox because history ids are only unique per mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKey {
    /// Keyed by message id.
    Message {
        /// Mailbox the message belongs to.
        mailbox: MailboxId,
        /// Mailbox-assigned message id.
        message: MessageId,
    },
    /// Keyed by history id.
    History {
        /// Mailbox the history id belongs to.
        mailbox: MailboxId,
        /// History position from the notification.
        history: HistoryId,
    },
}

impl std::fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message { mailbox, message } => write!(f, "{mailbox}/msg/{message}"),
            Self::History { mailbox, history } => write!(f, "{mailbox}/history/{history}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_reject_blank_values() {
        assert!(MailboxId::new("").is_none());
        assert!(MailboxId::new("   ").is_none());
        assert_eq!(
            MailboxId::new("ci@example.com").map(|m| m.to_string()),
            Some("ci@example.com".to_string())
        );
    }

    #[test]
    fn repository_id_splits_owner_and_name() {
        let repo = RepositoryId::new("ROCm/TheRock").unwrap();
        assert_eq!(repo.owner_and_name(), Some(("ROCm", "TheRock")));

        assert_eq!(RepositoryId::new("no-slash").unwrap().owner_and_name(), None);
        assert_eq!(RepositoryId::new("a/b/c").unwrap().owner_and_name(), None);
        assert_eq!(RepositoryId::new("/b").unwrap().owner_and_name(), None);
    }

    #[test]
    fn notification_key_display_is_mailbox_scoped() {
        let mailbox = MailboxId::new("ci@example.com").unwrap();
        let by_message = NotificationKey::Message {
            mailbox: mailbox.clone(),
            message: MessageId::new("18c0ffee").unwrap(),
        };
        let by_history = NotificationKey::History {
            mailbox,
            history: HistoryId::new(42),
        };

        assert_eq!(by_message.to_string(), "ci@example.com/msg/18c0ffee");
        assert_eq!(by_history.to_string(), "ci@example.com/history/42");
        assert_ne!(by_message, by_history);
    }
}
