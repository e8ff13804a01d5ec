//! In-process realtime change feed.
//!
//! Every repository mutation is published here as a [`PostChange`]; the SSE
//! route and in-process subscribers read from the same broadcast channel.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::{ChangeFilter, PostChange};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<PostChange>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Fan a change out to all current receivers. No receivers is not an error.
    pub fn publish(&self, change: PostChange) {
        let _ = self.sender.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PostChange> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Spawn a listener that calls `callback` once per change matching
    /// `filter`, in feed order. Must be called inside a tokio runtime.
    pub fn subscribe_changes<F>(&self, filter: ChangeFilter, callback: F) -> Subscription
    where
        F: Fn(PostChange) + Send + Sync + 'static,
    {
        let mut rx = self.sender.subscribe();
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(change) => {
                            if child.is_cancelled() { break; }
                            if filter.matches(&change) { callback(change); }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "change feed subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("change feed closed");
                            break;
                        }
                    }
                }
            }
        });
        Subscription::new(token, Some(handle))
    }
}

impl Default for ChangeFeed {
    fn default() -> Self { Self::new(DEFAULT_CAPACITY) }
}

/// Handle owning one realtime listener. Disposing (or dropping) it releases
/// the underlying receiver; no callback runs after disposal returns.
pub struct Subscription {
    token: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(token: CancellationToken, handle: Option<tokio::task::JoinHandle<()>>) -> Self {
        Self { token, handle }
    }

    pub fn dispose(mut self) {
        self.release();
    }

    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }

    fn release(&mut self) {
        self.token.cancel();
        if let Some(h) = self.handle.take() {
            h.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
