//! Duplicate suppression for redelivered notifications.
//!
//! Push transports deliver at least once, so the same notification routinely
//! arrives twice, sometimes concurrently. [`ClaimRegistry::claim`] is a single
//! atomic test-and-set: exactly one caller per identifier ever observes `true`.
//! There is deliberately no separate "contains" / "mark" pair.
//!
//! Claims are retained for at least the configured horizon and only then
//! become eligible for eviction by [`ClaimRegistry::evict_expired`].

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::{NotificationKey, RetentionConfig, Timestamp};

/// Records which notification identifiers have already been acted upon.
///
/// The in-memory [`InMemorySeenSet`] is the default backing. A shared external
/// store can replace it behind the same contract.
pub trait ClaimRegistry: Send + Sync {
    /// Atomically claims `key`.
    ///
    /// Returns `true` if the key was not yet recorded (it is now recorded with
    /// time `now`), and `false` if it was already claimed.
    fn claim(&self, key: &NotificationKey, now: Timestamp) -> bool;

    /// Removes claims recorded at least one retention horizon before `now`.
    /// Returns the number of claims removed.
    fn evict_expired(&self, now: Timestamp) -> usize;
}

/// In-memory claim registry. State resets on process restart.
#[derive(Debug)]
pub struct InMemorySeenSet {
    config: RetentionConfig,
    seen: DashMap<NotificationKey, Timestamp>,
}

impl InMemorySeenSet {
    /// Creates an empty registry.
    pub fn new(config: RetentionConfig) -> Self {
        Self {
            config,
            seen: DashMap::new(),
        }
    }

    /// Number of claims currently retained.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Returns `true` if no claims are retained.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl ClaimRegistry for InMemorySeenSet {
    fn claim(&self, key: &NotificationKey, now: Timestamp) -> bool {
        match self.seen.entry(key.clone()) {
            Entry::Occupied(existing) => {
                tracing::debug!(
                    notification = %key,
                    claimed_at = %existing.get(),
                    "notification already claimed"
                );
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    fn evict_expired(&self, now: Timestamp) -> usize {
        let horizon = self.config.horizon;
        let before = self.seen.len();
        self.seen
            .retain(|_, claimed_at| now.saturating_duration_since(*claimed_at) < horizon);
        let removed = before.saturating_sub(self.seen.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.seen.len(), "evicted expired claims");
        }
        removed
    }
}
