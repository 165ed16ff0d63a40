//! Per-origin sliding-window rate limiting.
//!
//! For every [`OriginKey`] the limiter keeps the timestamps of admitted
//! requests within the trailing window `W`. A request at `now` first drops
//! timestamps strictly older than `now - W`, then is admitted only if fewer
//! than `N` remain, in which case `now` is recorded.
//!
//! # Thread Safety
//!
//! Prune, check and record happen while holding the [`DashMap`] shard lock for
//! the key, so two concurrent requests can never both take the last slot.
//! Unrelated keys on different shards proceed in parallel.
//!
//! # Memory Management
//!
//! - Keys whose timestamps have all expired are removed by [`RateLimiter::sweep`],
//!   which the dispatcher's background task calls on a fixed interval.
//! - The number of tracked keys is capped by `max_tracked_keys`. When a new key
//!   arrives at the cap, a sweep is forced; if the table is still full the
//!   request is rejected. The cap is enforced per call and may be exceeded by a
//!   few entries when many new keys race past the check together.

use std::time::Duration;

use dashmap::DashMap;

use crate::{OriginKey, RateLimitConfig, Timestamp};

/// A request was refused by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    /// How long until the oldest counted request leaves the window.
    pub retry_after: Duration,
}

/// Admission control per origin key.
///
/// The in-memory [`SlidingWindowRateLimiter`] is the default backing. A shared
/// external store can replace it behind the same contract.
pub trait RateLimiter: Send + Sync {
    /// Atomically checks and, on admission, records a request from `key` at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimited`] when the ceiling for the current window is reached.
    fn check(&self, key: &OriginKey, now: Timestamp) -> Result<(), RateLimited>;

    /// Returns `true` if the request is admitted. Same effect as [`Self::check`].
    fn allow(&self, key: &OriginKey, now: Timestamp) -> bool {
        self.check(key, now).is_ok()
    }

    /// Drops expired timestamps and keys with none left. Returns the number of
    /// keys removed.
    fn sweep(&self, now: Timestamp) -> usize;
}

/// In-memory sliding-window rate limiter. State resets on process restart.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    config: RateLimitConfig,
    state: DashMap<OriginKey, Vec<Timestamp>>,
}

impl SlidingWindowRateLimiter {
    /// Creates a limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: DashMap::new(),
        }
    }

    /// Number of origin keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.state.len()
    }

    fn cutoff(&self, now: Timestamp) -> Option<Timestamp> {
        now.checked_sub(self.config.window)
    }

    fn retry_after(&self, timestamps: &[Timestamp], now: Timestamp) -> Duration {
        timestamps
            .iter()
            .min()
            .and_then(|oldest| oldest.checked_add(self.config.window))
            .map(|free_at| free_at.saturating_duration_since(now))
            .unwrap_or(self.config.window)
    }
}

fn prune(timestamps: &mut Vec<Timestamp>, cutoff: Option<Timestamp>) {
    if let Some(cutoff) = cutoff {
        timestamps.retain(|t| *t >= cutoff);
    }
}

impl RateLimiter for SlidingWindowRateLimiter {
    fn check(&self, key: &OriginKey, now: Timestamp) -> Result<(), RateLimited> {
        let cutoff = self.cutoff(now);

        if !self.state.contains_key(key) && self.state.len() >= self.config.max_tracked_keys {
            tracing::debug!(
                tracked_keys = self.state.len(),
                "max tracked origin keys reached, forcing sweep"
            );
            self.sweep(now);
            if self.state.len() >= self.config.max_tracked_keys {
                tracing::warn!(
                    origin = %key,
                    tracked_keys = self.state.len(),
                    max_tracked_keys = self.config.max_tracked_keys,
                    "rejecting new origin key: tracking table full"
                );
                return Err(RateLimited {
                    retry_after: self.config.window,
                });
            }
        }

        // The entry guard holds the shard lock until the end of this scope.
        let mut entry = self.state.entry(key.clone()).or_default();
        let timestamps = entry.value_mut();
        prune(timestamps, cutoff);

        if timestamps.len() >= self.config.max_requests as usize {
            let retry_after = self.retry_after(timestamps, now);
            tracing::warn!(
                origin = %key,
                requests = timestamps.len(),
                max = self.config.max_requests,
                retry_after_secs = retry_after.as_secs(),
                "rate limit exceeded"
            );
            return Err(RateLimited { retry_after });
        }

        timestamps.push(now);
        Ok(())
    }

    fn sweep(&self, now: Timestamp) -> usize {
        let cutoff = self.cutoff(now);
        let before = self.state.len();
        self.state.retain(|_, timestamps| {
            prune(timestamps, cutoff);
            !timestamps.is_empty()
        });
        before.saturating_sub(self.state.len())
    }
}
