//! In-memory document tree.
//!
//! # Responsibility
//! - Own every node of one document in an arena indexed by node id.
//! - Provide validated structural and property mutations.
//! - Record every mutation in the dirty tracker.
//!
//! # Invariants
//! - Node ids are unique and non-zero.
//! - The parent graph is acyclic.
//! - Every sibling list is ordered by strictly increasing `sequence`.
//! - Operations either apply completely or return an error before mutating.
//! - Only ids leave this module; slot positions never do.

pub mod bookmarks;
pub mod id_alloc;
pub mod load;
pub mod shared;
pub mod sync;

use crate::model::node::{now_epoch_secs, Body, ContentKind, NodeId, NodeRecord, Rgb};
use bookmarks::Bookmarks;
use id_alloc::NodeIdAllocator;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use sync::{DirtyTracker, SyncPending};

/// Errors returned by tree mutations and accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// Referenced node does not exist.
    NodeNotFound(NodeId),
    /// Move target is the node itself or one of its descendants.
    InvalidMove {
        node: NodeId,
        new_parent: NodeId,
    },
    /// `before` anchor is not a child of the destination parent.
    InvalidAnchor {
        anchor: NodeId,
        parent: Option<NodeId>,
    },
    /// Node is read-only for the requested change.
    ReadOnly(NodeId),
    /// Explicit id is already used by another node.
    DuplicateId(NodeId),
    /// Operation needs a body that has not been fetched yet.
    BodyNotResident(NodeId),
}

impl Display for TreeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NodeNotFound(id) => write!(f, "node not found: {id}"),
            Self::InvalidMove { node, new_parent } => write!(
                f,
                "move would create cycle: node {node} under parent {new_parent}"
            ),
            Self::InvalidAnchor { anchor, parent } => match parent {
                Some(parent) => write!(f, "node {anchor} is not a child of {parent}"),
                None => write!(f, "node {anchor} is not a top-level node"),
            },
            Self::ReadOnly(id) => write!(f, "node is read-only: {id}"),
            Self::DuplicateId(id) => write!(f, "node id already in use: {id}"),
            Self::BodyNotResident(id) => write!(f, "body of node {id} is not loaded"),
        }
    }
}

impl Error for TreeError {}

pub type TreeResult<T> = Result<T, TreeError>;

/// One editable scalar property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeProperty {
    Name(String),
    ContentKind(ContentKind),
    Tags(String),
    ReadOnly(bool),
    CustomIconId(u32),
    Bold(bool),
    Foreground(Option<Rgb>),
    ExcludeFromSearch(bool),
    ExcludeChildrenFromSearch(bool),
}

impl NodeProperty {
    /// Whether a read-only node rejects this change.
    ///
    /// Presentation and the read-only flag itself stay editable.
    pub fn respects_read_only(&self) -> bool {
        matches!(self, Self::Name(_) | Self::ContentKind(_) | Self::Tags(_))
    }

    fn apply(&self, record: &mut NodeRecord) {
        match self {
            Self::Name(name) => record.name = name.clone(),
            Self::ContentKind(kind) => record.content_kind = kind.clone(),
            Self::Tags(tags) => record.tags = tags.clone(),
            Self::ReadOnly(value) => record.is_read_only = *value,
            Self::CustomIconId(icon) => record.custom_icon_id = *icon,
            Self::Bold(value) => record.is_bold = *value,
            Self::Foreground(color) => record.foreground = *color,
            Self::ExcludeFromSearch(value) => record.exclude_from_search = *value,
            Self::ExcludeChildrenFromSearch(value) => {
                record.exclude_children_from_search = *value
            }
        }
    }
}

/// Arena entry: a record plus its position in the forest.
#[derive(Debug, Clone)]
pub struct TreeNode {
    record: NodeRecord,
    parent: Option<NodeId>,
    sequence: i64,
    children: Vec<NodeId>,
}

impl TreeNode {
    pub fn record(&self) -> &NodeRecord {
        &self.record
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Child ids in sibling order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Forest of nodes for one open document.
#[derive(Debug, Clone, Default)]
pub struct NoteTree {
    slots: Vec<Option<TreeNode>>,
    free_slots: Vec<usize>,
    index: HashMap<NodeId, usize>,
    roots: Vec<NodeId>,
    bookmarks: Bookmarks,
    tracker: DirtyTracker,
    ids: NodeIdAllocator,
}

impl NoteTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeRecord> {
        self.node(id).map(TreeNode::record)
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        let slot = *self.index.get(&id)?;
        self.slots.get(slot)?.as_ref()
    }

    /// Top-level ids in sibling order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Children of `parent`, or the roots when `parent` is `None`.
    pub fn children_of(&self, parent: Option<NodeId>) -> TreeResult<&[NodeId]> {
        match parent {
            None => Ok(&self.roots),
            Some(id) => Ok(self.require(id)?.children()),
        }
    }

    pub fn parent_of(&self, id: NodeId) -> TreeResult<Option<NodeId>> {
        Ok(self.require(id)?.parent)
    }

    pub fn sequence_of(&self, id: NodeId) -> TreeResult<i64> {
        Ok(self.require(id)?.sequence)
    }

    /// Ids from the top-level ancestor down to `id` inclusive.
    pub fn path_of(&self, id: NodeId) -> TreeResult<Vec<NodeId>> {
        let mut path = vec![id];
        let mut cursor = self.require(id)?.parent;
        while let Some(current) = cursor {
            path.push(current);
            cursor = self.require(current)?.parent;
        }
        path.reverse();
        Ok(path)
    }

    /// Every id in document order (parents before children).
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.len());
        for root in &self.roots {
            self.collect_subtree(*root, &mut out);
        }
        out
    }

    /// `id` and all of its descendants in document order.
    pub fn subtree_of(&self, id: NodeId) -> TreeResult<Vec<NodeId>> {
        self.require(id)?;
        let mut out = Vec::new();
        self.collect_subtree(id, &mut out);
        Ok(out)
    }

    /// Body visible at `id` after shared redirection; `None` if not loaded.
    pub fn body(&self, id: NodeId) -> TreeResult<Option<&Body>> {
        let owner = self.resolve_master(id)?;
        Ok(self.require(owner)?.record.body.as_ref())
    }

    pub fn bookmarks(&self) -> &Bookmarks {
        &self.bookmarks
    }

    /// Bookmarks `id`; returns `false` when it already was.
    pub fn add_bookmark(&mut self, id: NodeId) -> TreeResult<bool> {
        self.require(id)?;
        let added = self.bookmarks.add(id);
        if added {
            self.tracker.mark_bookmarks();
        }
        Ok(added)
    }

    pub fn remove_bookmark(&mut self, id: NodeId) -> bool {
        let removed = self.bookmarks.remove(id);
        if removed {
            self.tracker.mark_bookmarks();
        }
        removed
    }

    pub fn pending(&self) -> &SyncPending {
        self.tracker.pending()
    }

    pub fn is_dirty(&self) -> bool {
        self.tracker.is_dirty()
    }

    /// Takes the accumulated changes for one save attempt.
    pub fn drain_pending(&mut self) -> SyncPending {
        self.tracker.drain()
    }

    /// Hands back changes of a failed save attempt.
    pub fn restore_pending(&mut self, pending: SyncPending) {
        self.tracker.restore(pending);
    }

    pub fn mark_fix_tables(&mut self) {
        self.tracker.mark_fix_tables();
    }

    /// Allocates a fresh id from this document's allocator.
    pub fn next_id(&mut self) -> NodeId {
        self.ids.next_id()
    }

    /// Appends `record` as last child of `parent` (or as a new root).
    ///
    /// A zero `record.id` is replaced with a freshly allocated id.
    pub fn append(&mut self, parent: Option<NodeId>, mut record: NodeRecord) -> TreeResult<NodeId> {
        if let Some(parent) = parent {
            self.require(parent)?;
        }
        self.claim_id(&mut record)?;
        if record.body.is_none() && !record.is_shared_member() {
            record.body = Some(Body::default());
        }
        let sequence = self.next_sequence(parent, None);
        let position = self.siblings(parent).len();
        let id = self.attach(parent, sequence, position, record);
        self.tracker.mark_new(id);
        Ok(id)
    }

    /// Inserts `record` as the sibling directly following `after`.
    ///
    /// Followers whose sequence would collide are bumped and marked
    /// hierarchy-dirty; the rest of the sibling list is untouched.
    pub fn insert_after(&mut self, mut record: NodeRecord, after: NodeId) -> TreeResult<NodeId> {
        let anchor = self.require(after)?;
        let parent = anchor.parent;
        let sequence = anchor.sequence + 1;
        self.claim_id(&mut record)?;
        if record.body.is_none() && !record.is_shared_member() {
            record.body = Some(Body::default());
        }

        let position = self.position_in_siblings(parent, after)? + 1;
        self.bump_from(parent, position, sequence);
        let id = self.attach(parent, sequence, position, record);
        self.tracker.mark_new(id);
        Ok(id)
    }

    /// Moves `id` under `new_parent`, before `before` or at the end.
    ///
    /// # Errors
    /// - `InvalidMove` when `new_parent` is `id` or one of its descendants.
    /// - `InvalidAnchor` when `before` is not a child of `new_parent`.
    pub fn move_node(
        &mut self,
        id: NodeId,
        new_parent: Option<NodeId>,
        before: Option<NodeId>,
    ) -> TreeResult<()> {
        self.require(id)?;
        if let Some(parent) = new_parent {
            if self.would_create_cycle(id, parent)? {
                return Err(TreeError::InvalidMove {
                    node: id,
                    new_parent: parent,
                });
            }
        }
        if let Some(anchor) = before {
            let anchored = anchor != id
                && self.node(anchor).is_some_and(|node| node.parent == new_parent);
            if !anchored {
                return Err(TreeError::InvalidAnchor {
                    anchor,
                    parent: new_parent,
                });
            }
        }

        self.detach(id);
        let (sequence, position) = match before {
            None => (
                self.next_sequence(new_parent, None),
                self.siblings(new_parent).len(),
            ),
            Some(anchor) => {
                let position = self.position_in_siblings(new_parent, anchor)?;
                let floor = match position {
                    0 => 0,
                    _ => self.sequence_at(new_parent, position - 1),
                };
                let ceiling = self.sequence_at(new_parent, position);
                if floor + 1 < ceiling {
                    (floor + 1, position)
                } else {
                    self.bump_from(new_parent, position, ceiling);
                    (ceiling, position)
                }
            }
        };

        if let Some(node) = self.node_mut(id) {
            node.parent = new_parent;
            node.sequence = sequence;
        }
        self.siblings_mut(new_parent).insert(position, id);
        self.tracker.mark_hierarchy(id);
        debug!(
            "event=node_move module=tree status=ok node_id={id} sequence={sequence}"
        );
        Ok(())
    }

    /// Deletes `id` with its whole subtree; returns the removed ids.
    ///
    /// Shared masters whose group survives outside the subtree hand their
    /// body over to a surviving member first.
    ///
    /// # Errors
    /// - `NodeNotFound` for an unknown id.
    /// - `BodyNotResident` when a master that must hand over its body has
    ///   not been loaded yet; nothing is changed in that case.
    pub fn delete(&mut self, id: NodeId) -> TreeResult<Vec<NodeId>> {
        let removed = self.subtree_of(id)?;
        let doomed: HashSet<NodeId> = removed.iter().copied().collect();

        let handovers = self.plan_master_handovers(&removed, &doomed)?;
        for (master, survivors) in handovers {
            self.promote_master(master, &survivors);
        }

        self.detach(id);
        let mut bookmarks_changed = false;
        for removed_id in &removed {
            if let Some(slot) = self.index.remove(removed_id) {
                self.slots[slot] = None;
                self.free_slots.push(slot);
            }
            self.tracker.mark_removed(*removed_id);
            bookmarks_changed |= self.bookmarks.remove(*removed_id);
        }
        if bookmarks_changed {
            self.tracker.mark_bookmarks();
        }
        debug!(
            "event=node_delete module=tree status=ok node_id={id} removed={}",
            removed.len()
        );
        Ok(removed)
    }

    /// Changes one scalar property of `id`.
    pub fn set_property(&mut self, id: NodeId, property: NodeProperty) -> TreeResult<()> {
        let node = self.require(id)?;
        if property.respects_read_only() && node.record.is_read_only {
            return Err(TreeError::ReadOnly(id));
        }
        if let Some(node) = self.node_mut(id) {
            property.apply(&mut node.record);
        }
        self.tracker.mark_prop(id);
        Ok(())
    }

    /// Replaces the body visible at `id`; returns the id that owns it.
    ///
    /// Shared members redirect to their master.
    pub fn set_body(&mut self, id: NodeId, mut body: Body) -> TreeResult<NodeId> {
        let owner = self.resolve_master(id)?;
        if self.require(owner)?.record.is_read_only {
            return Err(TreeError::ReadOnly(owner));
        }
        body.sort_objects();
        if let Some(node) = self.node_mut(owner) {
            node.record.body = Some(body);
            node.record.modified_at = now_epoch_secs();
        }
        self.tracker.mark_body(owner);
        Ok(owner)
    }

    /// Installs a body fetched from storage without marking anything dirty.
    ///
    /// An already resident body is kept.
    pub fn cache_body(&mut self, id: NodeId, body: Body) -> TreeResult<NodeId> {
        let owner = self.resolve_master(id)?;
        if let Some(node) = self.node_mut(owner) {
            if node.record.body.is_none() {
                node.record.body = Some(body);
            }
        }
        Ok(owner)
    }

    pub(crate) fn require(&self, id: NodeId) -> TreeResult<&TreeNode> {
        self.node(id).ok_or(TreeError::NodeNotFound(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut TreeNode> {
        let slot = *self.index.get(&id)?;
        self.slots.get_mut(slot)?.as_mut()
    }

    pub(crate) fn tracker_mut(&mut self) -> &mut DirtyTracker {
        &mut self.tracker
    }

    pub(crate) fn bookmarks_mut(&mut self) -> &mut Bookmarks {
        &mut self.bookmarks
    }

    /// Sequence one past the largest sibling sequence, skipping `exclude`.
    pub(crate) fn next_sequence(&self, parent: Option<NodeId>, exclude: Option<NodeId>) -> i64 {
        self.siblings(parent)
            .iter()
            .filter(|sibling| Some(**sibling) != exclude)
            .filter_map(|sibling| self.node(*sibling))
            .map(|node| node.sequence)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Places `record` at `position` of `parent`'s children without checks.
    ///
    /// Callers guarantee id uniqueness and sequence ordering.
    pub(crate) fn attach(
        &mut self,
        parent: Option<NodeId>,
        sequence: i64,
        position: usize,
        record: NodeRecord,
    ) -> NodeId {
        let id = record.id;
        let node = TreeNode {
            record,
            parent,
            sequence,
            children: Vec::new(),
        };
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        self.ids.observe(id);
        self.siblings_mut(parent).insert(position, id);
        id
    }

    pub(crate) fn siblings(&self, parent: Option<NodeId>) -> &[NodeId] {
        match parent {
            None => &self.roots,
            Some(id) => self.node(id).map(TreeNode::children).unwrap_or(&[]),
        }
    }

    fn siblings_mut(&mut self, parent: Option<NodeId>) -> &mut Vec<NodeId> {
        match parent {
            Some(id) => match self.index.get(&id).copied() {
                Some(slot) => match self.slots[slot].as_mut() {
                    Some(node) => &mut node.children,
                    None => &mut self.roots,
                },
                None => &mut self.roots,
            },
            None => &mut self.roots,
        }
    }

    fn claim_id(&mut self, record: &mut NodeRecord) -> TreeResult<()> {
        if record.id == 0 {
            record.id = self.ids.next_id();
        } else if self.contains(record.id) {
            return Err(TreeError::DuplicateId(record.id));
        }
        Ok(())
    }

    fn position_in_siblings(&self, parent: Option<NodeId>, id: NodeId) -> TreeResult<usize> {
        self.siblings(parent)
            .iter()
            .position(|sibling| *sibling == id)
            .ok_or(TreeError::NodeNotFound(id))
    }

    fn sequence_at(&self, parent: Option<NodeId>, position: usize) -> i64 {
        self.siblings(parent)
            .get(position)
            .and_then(|id| self.node(*id))
            .map(|node| node.sequence)
            .unwrap_or(0)
    }

    /// Pushes siblings from `position` on past `taken` until the chain of
    /// collisions ends.
    fn bump_from(&mut self, parent: Option<NodeId>, position: usize, taken: i64) {
        let followers: Vec<NodeId> = self
            .siblings(parent)
            .iter()
            .skip(position)
            .copied()
            .collect();
        let mut floor = taken;
        for follower in followers {
            let Some(node) = self.node_mut(follower) else {
                continue;
            };
            if node.sequence > floor {
                break;
            }
            node.sequence = floor + 1;
            floor = node.sequence;
            self.tracker.mark_hierarchy(follower);
        }
    }

    fn detach(&mut self, id: NodeId) {
        let parent = self.node(id).and_then(|node| node.parent);
        self.siblings_mut(parent).retain(|sibling| *sibling != id);
    }

    fn would_create_cycle(&self, id: NodeId, candidate_parent: NodeId) -> TreeResult<bool> {
        let mut visited = HashSet::new();
        let mut cursor = Some(candidate_parent);
        while let Some(current) = cursor {
            if current == id || !visited.insert(current) {
                return Ok(true);
            }
            cursor = self.require(current)?.parent;
        }
        Ok(false)
    }

    fn collect_subtree(&self, id: NodeId, out: &mut Vec<NodeId>) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.node(current) else {
                continue;
            };
            out.push(current);
            stack.extend(node.children.iter().rev().copied());
        }
    }
}
