//! Per-post ephemeral state, held in one store keyed by post id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use super::vote::{VoteState, VoteWrite};
use crate::models::{Post, PostId, VoteCount, VoteDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    Pending,
    /// Terminal.
    Approved,
}

#[derive(Debug, Clone)]
pub struct CardState {
    pub post_id: PostId,
    pub votes: VoteState,
    pub approval: ApprovalState,
    /// Remote writes issued but not yet settled.
    pub in_flight: u32,
    /// Writes tagged with an older generation are stale and must not reach
    /// the server. Bumped on every re-seed and rollback.
    pub generation: u64,
}

impl CardState {
    pub fn from_post(post: &Post, generation: u64) -> Self {
        Self {
            post_id: post.id,
            votes: VoteState::new(post.votes()),
            approval: if post.status { ApprovalState::Approved } else { ApprovalState::Pending },
            in_flight: 0,
            generation,
        }
    }

    /// Returns true only on the Pending -> Approved edge.
    pub fn approve(&mut self) -> bool {
        let was_pending = self.approval == ApprovalState::Pending;
        self.approval = ApprovalState::Approved;
        was_pending
    }

    pub fn view(&self) -> CardView {
        let shown = self.votes.displayed();
        CardView {
            post_id: self.post_id,
            upvotes: shown.upvotes,
            downvotes: shown.downvotes,
            active_vote: self.votes.active(),
            approval: self.approval,
        }
    }
}

/// What a post card renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CardView {
    pub post_id: PostId,
    pub upvotes: u32,
    pub downvotes: u32,
    pub active_vote: Option<VoteDirection>,
    pub approval: ApprovalState,
}

impl CardView {
    pub fn is_approved(&self) -> bool {
        self.approval == ApprovalState::Approved
    }
}

/// Vote writes produced by one transition, tagged with the card generation
/// they were computed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrites {
    pub generation: u64,
    pub writes: Vec<VoteWrite>,
}

#[derive(Clone, Default)]
pub struct CardStore {
    cards: Arc<DashMap<PostId, CardState>>,
    generations: Arc<AtomicU64>,
}

impl CardStore {
    pub fn new() -> Self { Self::default() }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Seed (or re-seed) a card from a server snapshot. Writes queued for a
    /// previous incarnation of the card become stale.
    pub fn mount(&self, post: &Post) -> CardView {
        let card = CardState::from_post(post, self.next_generation());
        let view = card.view();
        self.cards.insert(post.id, card);
        view
    }

    pub fn unmount(&self, id: PostId) -> Option<CardState> {
        self.cards.remove(&id).map(|(_, c)| c)
    }

    pub fn contains(&self, id: PostId) -> bool {
        self.cards.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<PostId> {
        self.cards.iter().map(|e| *e.key()).collect()
    }

    pub fn view(&self, id: PostId) -> Option<CardView> {
        self.cards.get(&id).map(|c| c.view())
    }

    pub fn in_flight(&self, id: PostId) -> u32 {
        self.cards.get(&id).map(|c| c.in_flight).unwrap_or(0)
    }

    /// `None` when the card is not mounted.
    pub fn generation(&self, id: PostId) -> Option<u64> {
        self.cards.get(&id).map(|c| c.generation)
    }

    /// Optimistic transition; the returned writes are counted as in flight.
    pub fn apply_vote(&self, id: PostId, direction: VoteDirection) -> Option<(CardView, PendingWrites)> {
        let mut card = self.cards.get_mut(&id)?;
        let writes = card.votes.apply(direction);
        card.in_flight += writes.len() as u32;
        Some((card.view(), PendingWrites { generation: card.generation, writes }))
    }

    /// Settle one write. Ignored when the card has moved to a newer
    /// generation, whose counter no longer includes it.
    pub fn write_settled(&self, id: PostId, generation: u64) {
        if let Some(mut card) = self.cards.get_mut(&id) {
            if card.generation == generation {
                card.in_flight = card.in_flight.saturating_sub(1);
            }
        }
    }

    /// `Some(true)` when this call moved the card to Approved.
    pub fn approve(&self, id: PostId) -> Option<bool> {
        self.cards.get_mut(&id).map(|mut c| c.approve())
    }

    /// Replace counts with server truth unless writes are still in flight.
    /// Returns the new view, or `None` when skipped or not mounted.
    pub fn reconcile(&self, id: PostId, server: VoteCount) -> Option<CardView> {
        let mut card = self.cards.get_mut(&id)?;
        if card.in_flight > 0 {
            return None;
        }
        card.votes.reconcile(server);
        Some(card.view())
    }

    /// Drop the local vote, show `server` counts and invalidate every write
    /// still queued for the card.
    pub fn rollback(&self, id: PostId, server: VoteCount) -> Option<CardView> {
        let generation = self.next_generation();
        let mut card = self.cards.get_mut(&id)?;
        card.votes.rollback(server);
        card.generation = generation;
        card.in_flight = 0;
        Some(card.view())
    }

    /// Rollback without fresh server counts: fall back to the last known
    /// baseline.
    pub fn discard_local(&self, id: PostId) -> Option<CardView> {
        let baseline = self.cards.get(&id)?.votes.baseline();
        self.rollback(id, baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;

    fn post(up: u32, down: u32, status: bool) -> Post {
        Post {
            id: uuid::Uuid::new_v4(),
            created_at: chrono::Utc::now(),
            author: "anonymous".into(),
            title: "Illegal dumping".into(),
            description: String::new(),
            image_url: None,
            location: String::new(),
            latitude: None,
            longitude: None,
            upvotes: up,
            downvotes: down,
            status,
            resolved: 0,
            category: vec![],
            tags: vec![],
            severity: Severity::Critical,
        }
    }

    #[test]
    fn initial_state_comes_from_snapshot() {
        let store = CardStore::new();
        let v = store.mount(&post(30, 2, false));
        assert_eq!((v.upvotes, v.downvotes, v.active_vote), (30, 2, None));
        assert_eq!(v.approval, ApprovalState::Pending);
        let v = store.mount(&post(0, 0, true));
        assert!(v.is_approved());
    }

    #[test]
    fn approval_is_terminal() {
        let store = CardStore::new();
        let p = post(1, 0, false);
        store.mount(&p);
        assert_eq!(store.approve(p.id), Some(true));
        assert_eq!(store.approve(p.id), Some(false));
        assert!(store.view(p.id).unwrap().is_approved());
        assert_eq!(store.approve(uuid::Uuid::new_v4()), None);
    }

    #[test]
    fn cards_are_independent() {
        let store = CardStore::new();
        let a = post(10, 0, false);
        let b = post(10, 0, false);
        store.mount(&a);
        store.mount(&b);
        store.apply_vote(a.id, VoteDirection::Up).unwrap();
        store.approve(a.id);
        let vb = store.view(b.id).unwrap();
        assert_eq!((vb.upvotes, vb.active_vote, vb.approval), (10, None, ApprovalState::Pending));
    }

    #[test]
    fn reconcile_waits_for_in_flight_writes() {
        let store = CardStore::new();
        let p = post(30, 2, false);
        store.mount(&p);
        let (_, pending) = store.apply_vote(p.id, VoteDirection::Up).unwrap();
        assert_eq!(store.in_flight(p.id), pending.writes.len() as u32);
        assert!(store.reconcile(p.id, VoteCount { upvotes: 30, downvotes: 2 }).is_none());

        store.write_settled(p.id, pending.generation);
        let v = store.reconcile(p.id, VoteCount { upvotes: 31, downvotes: 2 }).unwrap();
        assert_eq!((v.upvotes, v.active_vote), (31, Some(VoteDirection::Up)));
    }

    #[test]
    fn rollback_invalidates_queued_writes() {
        let store = CardStore::new();
        let p = post(30, 2, false);
        store.mount(&p);
        let (_, first) = store.apply_vote(p.id, VoteDirection::Up).unwrap();
        let (_, second) = store.apply_vote(p.id, VoteDirection::Down).unwrap();
        assert_eq!(first.generation, second.generation);
        assert_eq!(store.in_flight(p.id), 3);

        let v = store.rollback(p.id, VoteCount { upvotes: 30, downvotes: 2 }).unwrap();
        assert_eq!((v.upvotes, v.downvotes, v.active_vote), (30, 2, None));
        assert_ne!(store.generation(p.id), Some(first.generation));
        assert_eq!(store.in_flight(p.id), 0);

        // a stale settle must not eat into the new generation's count
        let (_, fresh) = store.apply_vote(p.id, VoteDirection::Down).unwrap();
        store.write_settled(p.id, first.generation);
        assert_eq!(store.in_flight(p.id), 1);
        store.write_settled(p.id, fresh.generation);
        assert_eq!(store.in_flight(p.id), 0);
    }

    #[test]
    fn remount_starts_a_new_generation() {
        let store = CardStore::new();
        let p = post(5, 0, false);
        store.mount(&p);
        let before = store.generation(p.id).unwrap();
        store.mount(&p);
        assert!(store.generation(p.id).unwrap() > before);
    }

    #[test]
    fn discard_local_returns_to_baseline() {
        let store = CardStore::new();
        let p = post(7, 1, false);
        store.mount(&p);
        store.apply_vote(p.id, VoteDirection::Down).unwrap();
        let v = store.discard_local(p.id).unwrap();
        assert_eq!((v.upvotes, v.downvotes, v.active_vote), (7, 1, None));
    }
}
