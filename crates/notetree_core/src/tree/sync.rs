//! Dirty tracking between save cycles.
//!
//! # Responsibility
//! - Accumulate which nodes changed and how since the last successful save.
//! - Hand the accumulated set to a backend exactly once per save attempt.
//!
//! # Invariants
//! - Marking is idempotent (flag union).
//! - An id is never both in `node_states` and `removed_ids`.
//! - `restore` after `drain` loses nothing marked in either cycle.

use crate::model::node::NodeId;
use std::collections::{BTreeMap, BTreeSet};

/// Per-node change flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeSyncState {
    /// Node has never been persisted.
    pub is_new: bool,
    /// Scalar properties changed.
    pub prop_dirty: bool,
    /// Body text or anchored objects changed.
    pub body_dirty: bool,
    /// Parent, sequence or master reference changed.
    pub hierarchy_dirty: bool,
}

impl NodeSyncState {
    /// State of a freshly created node: everything must be written.
    pub fn new_node() -> Self {
        Self {
            is_new: true,
            prop_dirty: true,
            body_dirty: true,
            hierarchy_dirty: true,
        }
    }

    pub fn merge(&mut self, other: NodeSyncState) {
        self.is_new |= other.is_new;
        self.prop_dirty |= other.prop_dirty;
        self.body_dirty |= other.body_dirty;
        self.hierarchy_dirty |= other.hierarchy_dirty;
    }

    pub fn is_clean(&self) -> bool {
        !(self.is_new || self.prop_dirty || self.body_dirty || self.hierarchy_dirty)
    }
}

/// Everything a backend must persist on the next save.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncPending {
    /// Backend-specific structural repair is needed.
    pub fix_tables: bool,
    /// Bookmark list changed.
    pub bookmarks_dirty: bool,
    pub node_states: BTreeMap<NodeId, NodeSyncState>,
    pub removed_ids: BTreeSet<NodeId>,
}

impl SyncPending {
    pub fn is_empty(&self) -> bool {
        !self.fix_tables
            && !self.bookmarks_dirty
            && self.node_states.is_empty()
            && self.removed_ids.is_empty()
    }

    /// Unions `other` into `self`, keeping removals authoritative.
    pub fn merge(&mut self, other: SyncPending) {
        self.fix_tables |= other.fix_tables;
        self.bookmarks_dirty |= other.bookmarks_dirty;
        for (id, state) in other.node_states {
            self.node_states.entry(id).or_default().merge(state);
        }
        self.removed_ids.extend(other.removed_ids);
        let removed = &self.removed_ids;
        self.node_states.retain(|id, _| !removed.contains(id));
    }
}

/// Accumulator feeding the active storage backend.
#[derive(Debug, Clone, Default)]
pub struct DirtyTracker {
    pending: SyncPending,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_new(&mut self, id: NodeId) {
        self.state_mut(id).merge(NodeSyncState::new_node());
    }

    pub fn mark_prop(&mut self, id: NodeId) {
        self.state_mut(id).prop_dirty = true;
    }

    pub fn mark_body(&mut self, id: NodeId) {
        self.state_mut(id).body_dirty = true;
    }

    pub fn mark_hierarchy(&mut self, id: NodeId) {
        self.state_mut(id).hierarchy_dirty = true;
    }

    /// Records a deletion.
    ///
    /// A node created and deleted within the same cycle was never persisted,
    /// so it only drops its pending state.
    pub fn mark_removed(&mut self, id: NodeId) {
        let never_persisted = self
            .pending
            .node_states
            .remove(&id)
            .is_some_and(|state| state.is_new);
        if !never_persisted {
            self.pending.removed_ids.insert(id);
        }
    }

    pub fn mark_bookmarks(&mut self) {
        self.pending.bookmarks_dirty = true;
    }

    pub fn mark_fix_tables(&mut self) {
        self.pending.fix_tables = true;
    }

    pub fn pending(&self) -> &SyncPending {
        &self.pending
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Returns and clears the accumulated state.
    pub fn drain(&mut self) -> SyncPending {
        std::mem::take(&mut self.pending)
    }

    /// Merges a drained state back after a failed save.
    pub fn restore(&mut self, state: SyncPending) {
        let newer = std::mem::take(&mut self.pending);
        self.pending = state;
        self.pending.merge(newer);
    }

    /// Forgets everything (used right after a successful load).
    pub fn clear(&mut self) {
        self.pending = SyncPending::default();
    }

    fn state_mut(&mut self, id: NodeId) -> &mut NodeSyncState {
        self.pending.node_states.entry(id).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::{DirtyTracker, NodeSyncState};

    #[test]
    fn marking_twice_is_idempotent() {
        let mut tracker = DirtyTracker::new();
        tracker.mark_prop(3);
        tracker.mark_prop(3);
        tracker.mark_body(3);

        let pending = tracker.drain();
        assert_eq!(pending.node_states.len(), 1);
        assert_eq!(
            pending.node_states[&3],
            NodeSyncState {
                is_new: false,
                prop_dirty: true,
                body_dirty: true,
                hierarchy_dirty: false,
            }
        );
    }

    #[test]
    fn drain_clears_state() {
        let mut tracker = DirtyTracker::new();
        tracker.mark_bookmarks();
        assert!(tracker.is_dirty());
        let pending = tracker.drain();
        assert!(pending.bookmarks_dirty);
        assert!(!tracker.is_dirty());
        assert!(tracker.drain().is_empty());
    }

    #[test]
    fn removing_new_node_leaves_no_trace() {
        let mut tracker = DirtyTracker::new();
        tracker.mark_new(9);
        tracker.mark_removed(9);
        assert!(tracker.drain().is_empty());
    }

    #[test]
    fn removing_persisted_node_drops_its_state() {
        let mut tracker = DirtyTracker::new();
        tracker.mark_prop(4);
        tracker.mark_removed(4);
        let pending = tracker.drain();
        assert!(pending.node_states.is_empty());
        assert!(pending.removed_ids.contains(&4));
    }

    #[test]
    fn restore_merges_with_changes_made_after_drain() {
        let mut tracker = DirtyTracker::new();
        tracker.mark_prop(1);
        tracker.mark_hierarchy(2);
        let drained = tracker.drain();

        tracker.mark_body(1);
        tracker.mark_removed(2);
        tracker.restore(drained);

        let pending = tracker.drain();
        let state = pending.node_states[&1];
        assert!(state.prop_dirty && state.body_dirty);
        assert!(!pending.node_states.contains_key(&2));
        assert!(pending.removed_ids.contains(&2));
    }
}
