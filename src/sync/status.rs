//! Long-lived status subscriptions with resubscription on transport failure.
//!
//! The channel is scoped per predicate, not per post: callers filter by id
//! themselves. When the stream breaks, the channel reopens it with
//! exponential backoff and fires the resync hook so callers can re-read
//! whatever they may have missed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::gateway::{GatewayError, RemoteGateway};
use crate::feed::Subscription;
use crate::models::{ChangeFilter, PostChange, PostId};

/// Resubscription delays: `base` after the first failure, doubling per
/// consecutive failure, never above `cap`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), cap: Duration::from_secs(30) }
    }
}

impl BackoffConfig {
    pub fn start(self) -> Backoff {
        Backoff { config: self, failures: 0 }
    }
}

/// Per-subscription backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    /// Delay to wait before the next attempt; counts one more failure.
    pub fn next(&mut self) -> Duration {
        // 2^16 seconds is far past any sensible cap
        let factor = 1u32 << self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        self.config.base.saturating_mul(factor).min(self.config.cap)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Clone)]
pub struct StatusChannel {
    gateway: Arc<dyn RemoteGateway>,
    backoff: BackoffConfig,
}

impl StatusChannel {
    pub fn new(gateway: Arc<dyn RemoteGateway>, backoff: BackoffConfig) -> Self {
        Self { gateway, backoff }
    }

    /// One-shot read of the current status.
    pub async fn check_status_now(&self, id: PostId) -> Result<bool, GatewayError> {
        self.gateway.check_status(id).await
    }

    pub fn subscribe<F>(&self, filter: ChangeFilter, on_change: F) -> Subscription
    where
        F: Fn(PostChange) + Send + Sync + 'static,
    {
        self.subscribe_with_resync(filter, on_change, || {})
    }

    /// Like [`subscribe`](Self::subscribe); `on_resync` runs after every
    /// reconnect and whenever the stream reports dropped events.
    pub fn subscribe_with_resync<F, R>(&self, filter: ChangeFilter, on_change: F, on_resync: R) -> Subscription
    where
        F: Fn(PostChange) + Send + Sync + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let gateway = self.gateway.clone();
        let mut backoff = self.backoff.start();

        let handle = tokio::spawn(async move {
            let mut connected_before = false;
            loop {
                let opened = tokio::select! {
                    _ = cancel.cancelled() => return,
                    opened = gateway.open_changes(filter) => opened,
                };
                match opened {
                    Ok(mut stream) => {
                        if connected_before {
                            tracing::info!(failures = backoff.failures(), "status subscription re-established");
                            on_resync();
                        }
                        connected_before = true;
                        backoff.reset();
                        loop {
                            let item = tokio::select! {
                                _ = cancel.cancelled() => return,
                                item = stream.next() => item,
                            };
                            match item {
                                Some(Ok(change)) => {
                                    if cancel.is_cancelled() { return; }
                                    if filter.matches(&change) { on_change(change); }
                                }
                                Some(Err(GatewayError::Lagged(n))) => {
                                    tracing::warn!(skipped = n, "status subscription lagged; resyncing");
                                    on_resync();
                                }
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "status subscription transport failed");
                                    break;
                                }
                                None => {
                                    tracing::info!("status subscription stream ended");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, failures = backoff.failures() + 1, "status subscription could not be opened");
                    }
                }

                let delay = backoff.next();
                tracing::debug!(?delay, "resubscribing after delay");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });

        Subscription::new(token, Some(handle))
    }
}
