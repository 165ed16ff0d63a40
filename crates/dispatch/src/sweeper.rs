//! Background eviction of expired rate-limit and claim state.

use std::sync::Arc;
use std::time::Duration;

use pipeline::Timestamp;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::Dispatcher;

/// Default period between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawns a task that calls [`Dispatcher::sweep`] every `interval` until
/// `shutdown` flips to `true` or its sender is dropped.
pub fn spawn_sweeper(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = dispatcher.sweep(Timestamp::now());
                    if report.rate_keys > 0 || report.claims > 0 {
                        tracing::debug!(
                            rate_keys = report.rate_keys,
                            claims = report.claims,
                            "evicted expired state"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("sweeper stopping");
                        break;
                    }
                }
            }
        }
    })
}
