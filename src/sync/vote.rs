//! Toggle semantics for a single user's vote on a single post.
//!
//! [`VoteState::apply`] is a pure transition: it mutates the displayed counts
//! immediately and returns the remote writes that make the change durable.
//! Displayed counts never drift more than one above the baseline.

use crate::models::{VoteCount, VoteDirection, VoteField};

/// One counter write produced by a transition. `value` is the absolute new
/// count, `delta` the change relative to what was displayed before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteWrite {
    pub field: VoteField,
    pub value: u32,
    pub delta: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteState {
    baseline: VoteCount,
    displayed: VoteCount,
    active: Option<VoteDirection>,
}

impl VoteState {
    pub fn new(baseline: VoteCount) -> Self {
        Self { baseline, displayed: baseline, active: None }
    }

    pub fn baseline(&self) -> VoteCount { self.baseline }
    pub fn displayed(&self) -> VoteCount { self.displayed }
    pub fn active(&self) -> Option<VoteDirection> { self.active }

    pub fn apply(&mut self, direction: VoteDirection) -> Vec<VoteWrite> {
        let mut writes = Vec::with_capacity(2);
        match self.active {
            Some(current) if current == direction => {
                // retraction
                writes.push(self.set(direction.field(), self.baseline.get(direction.field())));
                self.active = None;
            }
            Some(current) => {
                // switch: undo the other side first
                writes.push(self.set(current.field(), self.baseline.get(current.field())));
                writes.push(self.set(direction.field(), self.baseline.get(direction.field()).saturating_add(1)));
                self.active = Some(direction);
            }
            None => {
                writes.push(self.set(direction.field(), self.baseline.get(direction.field()).saturating_add(1)));
                self.active = Some(direction);
            }
        }
        writes
    }

    /// Adopt authoritative counts that already include this client's active vote.
    pub fn reconcile(&mut self, server: VoteCount) {
        let mut baseline = server;
        if let Some(active) = self.active {
            let field = active.field();
            baseline.set(field, server.get(field).saturating_sub(1));
        }
        self.baseline = baseline;
        self.displayed = self.offset_from_baseline();
    }

    /// Drop the local vote and show the server's counts verbatim.
    pub fn rollback(&mut self, server: VoteCount) {
        self.active = None;
        self.baseline = server;
        self.displayed = server;
    }

    fn offset_from_baseline(&self) -> VoteCount {
        let mut shown = self.baseline;
        if let Some(active) = self.active {
            let field = active.field();
            shown.set(field, self.baseline.get(field).saturating_add(1));
        }
        shown
    }

    fn set(&mut self, field: VoteField, value: u32) -> VoteWrite {
        let previous = self.displayed.get(field);
        self.displayed.set(field, value);
        let delta = i64::from(value) - i64::from(previous);
        VoteWrite { field, value, delta: delta as i32 }
    }
}
