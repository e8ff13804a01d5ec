//! Optimistic vote pipeline and per-card wiring.
//!
//! `apply_vote` changes the card synchronously and hands the resulting writes
//! to a per-card writer task, which persists them in click order. Approval
//! arrives either through the status subscription or through the recheck that
//! follows every successful upvote write, whichever lands first.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::card::{CardStore, CardView};
use super::gateway::{GatewayError, RemoteGateway};
use super::status::{BackoffConfig, StatusChannel};
use super::vote::VoteWrite;
use crate::feed::Subscription;
use crate::models::{ChangeFilter, Post, PostChange, PostId, VoteDirection, VoteField};

/// How a vote write reaches the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Atomic server-side increment/decrement.
    #[default]
    Delta,
    /// Client-computed absolute count; concurrent voters can overwrite each other.
    Absolute,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub write_mode: WriteMode,
    pub backoff: BackoffConfig,
    /// `None` disables the periodic reconciliation pass.
    pub reconcile_period: Option<Duration>,
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::Delta,
            backoff: BackoffConfig::default(),
            reconcile_period: Some(Duration::from_secs(60)),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(mode) = std::env::var("SYNC_WRITE_MODE") {
            cfg.write_mode = match mode.to_ascii_lowercase().as_str() {
                "absolute" => WriteMode::Absolute,
                _ => WriteMode::Delta,
            };
        }
        if let Some(secs) = std::env::var("SYNC_RECONCILE_SECS").ok().and_then(|v| v.parse::<u64>().ok()) {
            cfg.reconcile_period = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = std::env::var("SYNC_RESUBSCRIBE_BASE_MS").ok().and_then(|v| v.parse::<u64>().ok()) {
            cfg.backoff.base = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = std::env::var("SYNC_RESUBSCRIBE_CAP_SECS").ok().and_then(|v| v.parse::<u64>().ok()) {
            cfg.backoff.cap = Duration::from_secs(secs).max(cfg.backoff.base);
        }
        cfg
    }
}

/// Outcomes surfaced to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    WriteFailed { post_id: PostId, field: VoteField, error: String },
    RolledBack { view: CardView },
    Reconciled { view: CardView },
    Approved { post_id: PostId },
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("post {0} is not mounted")]
    NotMounted(PostId),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

type Subscriptions = DashMap<PostId, Subscription>;

/// Handles the background tasks need. The subscription map is held weakly so
/// a listener's own closure never keeps its subscription alive.
#[derive(Clone)]
struct Shared {
    gateway: Arc<dyn RemoteGateway>,
    store: CardStore,
    events: broadcast::Sender<SyncEvent>,
    subscriptions: Weak<Subscriptions>,
    write_mode: WriteMode,
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn mark_approved(&self, id: PostId) {
        if self.store.approve(id) == Some(true) {
            info!(post_id = %id, "card approved");
            self.emit(SyncEvent::Approved { post_id: id });
        }
        if let Some(subs) = self.subscriptions.upgrade() {
            if let Some((_, sub)) = subs.remove(&id) {
                sub.dispose();
            }
        }
    }

    async fn check_status_now(&self, id: PostId) -> Result<bool, GatewayError> {
        let approved = self.gateway.check_status(id).await?;
        if approved {
            self.mark_approved(id);
        }
        Ok(approved)
    }

    async fn persist(&self, id: PostId, write: VoteWrite) -> Result<Post, GatewayError> {
        match self.write_mode {
            WriteMode::Delta => self.gateway.adjust_vote_count(id, write.field, write.delta).await,
            WriteMode::Absolute => self.gateway.write_vote_count(id, write.field, write.value).await,
        }
    }

    /// Every write queued before this returns is stale once it does, including
    /// clicks made while the counts were being fetched.
    async fn rollback(&self, id: PostId) {
        match self.gateway.read_post(id).await {
            Ok(post) => {
                if let Some(view) = self.store.rollback(id, post.votes()) {
                    warn!(post_id = %id, upvotes = view.upvotes, downvotes = view.downvotes, "rolled back to server counts");
                    self.emit(SyncEvent::RolledBack { view });
                }
                if post.status {
                    self.mark_approved(id);
                }
            }
            Err(e) => {
                warn!(post_id = %id, error = %e, "could not fetch counts for rollback");
                if let Some(view) = self.store.discard_local(id) {
                    self.emit(SyncEvent::RolledBack { view });
                }
            }
        }
    }
}

/// A vote write tagged with the card generation it was computed under.
#[derive(Debug, Clone, Copy)]
struct QueuedWrite {
    write: VoteWrite,
    generation: u64,
}

async fn run_writer(shared: Shared, id: PostId, mut rx: mpsc::UnboundedReceiver<QueuedWrite>) {
    while let Some(QueuedWrite { write, generation }) = rx.recv().await {
        // an unmounted card keeps its queued writes; a rolled back or
        // re-seeded one does not
        if shared.store.generation(id).map_or(false, |current| current != generation) {
            metrics::increment_counter!("ecoreport_sync_writes_total", "outcome" => "stale");
            debug!(post_id = %id, field = write.field.as_str(), generation, "dropping stale vote write");
            continue;
        }
        let result = shared.persist(id, write).await;
        shared.store.write_settled(id, generation);
        match result {
            Ok(post) => {
                metrics::increment_counter!("ecoreport_sync_writes_total", "outcome" => "ok");
                debug!(post_id = %id, field = write.field.as_str(), upvotes = post.upvotes, downvotes = post.downvotes, "vote persisted");
                if write.field == VoteField::Upvotes {
                    if let Err(e) = shared.check_status_now(id).await {
                        warn!(post_id = %id, error = %e, "status recheck failed");
                    }
                }
            }
            Err(e) => {
                metrics::increment_counter!("ecoreport_sync_writes_total", "outcome" => "error");
                error!(post_id = %id, field = write.field.as_str(), error = %e, "vote write failed");
                shared.emit(SyncEvent::WriteFailed { post_id: id, field: write.field, error: e.to_string() });
                shared.rollback(id).await;
            }
        }
    }
}

#[derive(Clone)]
pub struct SyncClient {
    shared: Shared,
    channel: StatusChannel,
    subscriptions: Arc<Subscriptions>,
    writers: Arc<DashMap<PostId, mpsc::UnboundedSender<QueuedWrite>>>,
    config: Arc<SyncConfig>,
}

impl SyncClient {
    /// Must be created and used inside a tokio runtime.
    pub fn new(gateway: Arc<dyn RemoteGateway>, config: SyncConfig) -> Self {
        let subscriptions: Arc<Subscriptions> = Arc::new(DashMap::new());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Shared {
            gateway: gateway.clone(),
            store: CardStore::new(),
            events,
            subscriptions: Arc::downgrade(&subscriptions),
            write_mode: config.write_mode,
        };
        Self {
            shared,
            channel: StatusChannel::new(gateway, config.backoff),
            subscriptions,
            writers: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub fn view(&self, id: PostId) -> Option<CardView> {
        self.shared.store.view(id)
    }

    /// True while the card holds a live status subscription.
    pub fn is_subscribed(&self, id: PostId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    /// Fetch every post and mount a card for each. A failed read yields an
    /// empty feed.
    pub async fn load_feed(&self) -> Vec<CardView> {
        match self.shared.gateway.read_posts().await {
            Ok(posts) => posts.iter().map(|p| self.mount(p)).collect(),
            Err(e) => {
                error!(error = %e, "failed to load posts");
                Vec::new()
            }
        }
    }

    /// Seed a card from a server snapshot and, unless already approved, start
    /// listening for its approval. A card with writes still in flight keeps
    /// its local state; the snapshot would not include them.
    pub fn mount(&self, post: &Post) -> CardView {
        let id = post.id;
        if self.shared.store.in_flight(id) > 0 {
            if let Some(view) = self.shared.store.view(id) {
                debug!(post_id = %id, "card busy; keeping local state on re-mount");
                return view;
            }
        }
        let view = self.shared.store.mount(post);

        let live = self.writers.get(&id).map_or(false, |tx| !tx.is_closed());
        if !live {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_writer(self.shared.clone(), id, rx));
            self.writers.insert(id, tx);
        }

        if view.is_approved() {
            self.release_subscription(id);
        } else if !self.is_subscribed(id) {
            self.watch(id);
        }
        view
    }

    /// Tear a card down. Writes already queued still reach the server.
    pub fn unmount(&self, id: PostId) {
        self.shared.store.unmount(id);
        self.writers.remove(&id);
        self.release_subscription(id);
    }

    /// Dispose every subscription and writer.
    pub fn shutdown(&self) {
        self.writers.clear();
        self.subscriptions.clear();
    }

    pub fn apply_vote(&self, id: PostId, direction: VoteDirection) -> Result<CardView, SyncError> {
        let (view, pending) = self.shared.store.apply_vote(id, direction).ok_or(SyncError::NotMounted(id))?;
        let writer = self.writers.get(&id).map(|w| w.clone());
        let generation = pending.generation;
        for write in pending.writes {
            let queued = writer.as_ref().map_or(false, |tx| tx.send(QueuedWrite { write, generation }).is_ok());
            if !queued {
                warn!(post_id = %id, "no writer for card; dropping vote write");
                self.shared.store.write_settled(id, generation);
            }
        }
        Ok(view)
    }

    pub async fn check_status_now(&self, id: PostId) -> Result<bool, SyncError> {
        Ok(self.shared.check_status_now(id).await?)
    }

    /// Replace a card's counts with server truth. `Ok(None)` when skipped
    /// because writes are still in flight.
    pub async fn reconcile(&self, id: PostId) -> Result<Option<CardView>, SyncError> {
        if !self.shared.store.contains(id) {
            return Err(SyncError::NotMounted(id));
        }
        if self.shared.store.in_flight(id) > 0 {
            debug!(post_id = %id, "reconcile skipped; writes in flight");
            return Ok(None);
        }
        let post = self.shared.gateway.read_post(id).await?;
        let reconciled = self.shared.store.reconcile(id, post.votes());
        if post.status {
            self.shared.mark_approved(id);
        }
        let view = reconciled.and_then(|_| self.shared.store.view(id));
        if let Some(view) = view {
            self.shared.emit(SyncEvent::Reconciled { view });
        }
        Ok(view)
    }

    /// Reconcile every mounted card; returns how many were updated.
    pub async fn reconcile_all(&self) -> usize {
        let mut updated = 0;
        for id in self.shared.store.ids() {
            match self.reconcile(id).await {
                Ok(Some(_)) => updated += 1,
                Ok(None) => {}
                Err(e) => warn!(post_id = %id, error = %e, "reconcile failed"),
            }
        }
        updated
    }

    /// Periodic reconciliation. Abort the handle to stop it.
    pub fn spawn_reconciler(&self, period: Duration) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                let updated = client.reconcile_all().await;
                debug!(updated, "reconciliation pass finished");
            }
        })
    }

    /// Starts the reconciler when [`SyncConfig::reconcile_period`] is set.
    pub fn spawn_configured_reconciler(&self) -> Option<JoinHandle<()>> {
        self.config.reconcile_period.map(|p| self.spawn_reconciler(p))
    }

    fn watch(&self, id: PostId) {
        let on_approved = self.shared.clone();
        let on_change = move |change: PostChange| {
            // the feed is filtered per predicate, not per post
            if change.post.id != id || !change.post.status {
                return;
            }
            on_approved.mark_approved(id);
        };
        let resync = self.shared.clone();
        let on_resync = move || {
            let shared = resync.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.check_status_now(id).await {
                    warn!(post_id = %id, error = %e, "status resync failed");
                }
            });
        };
        let sub = self.channel.subscribe_with_resync(ChangeFilter::approved(), on_change, on_resync);
        self.subscriptions.insert(id, sub);

        // approval may have landed before the handle was stored
        if self.shared.store.view(id).map_or(true, |v| v.is_approved()) {
            self.release_subscription(id);
        }
    }

    fn release_subscription(&self, id: PostId) {
        if let Some((_, sub)) = self.subscriptions.remove(&id) {
            sub.dispose();
        }
    }
}
