//! Load-time sinks that attach enumerated nodes to a tree.
//!
//! # Responsibility
//! - `PopulateSink`: fill an empty tree from a document, repairing
//!   duplicated ids, colliding sequences, stale bookmarks and broken
//!   shared groups.
//! - `ImportSink`: graft another document under an existing node with
//!   fresh ids.
//!
//! # Invariants
//! - Parents are attached before their children.
//! - Repairs are marked dirty so the next save persists them.

use super::NoteTree;
use crate::model::node::{Body, NodeId, NodeRecord};
use crate::storage::{LoadError, NodeSink, StorageBackend};
use log::{info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Sink used when opening a document into a fresh tree.
pub struct PopulateSink<'a> {
    tree: &'a mut NoteTree,
    path: PathBuf,
    bookmarks: Vec<NodeId>,
    reassigned: usize,
}

impl<'a> PopulateSink<'a> {
    pub fn new(tree: &'a mut NoteTree, path: &Path) -> Self {
        Self {
            tree,
            path: path.to_path_buf(),
            bookmarks: Vec::new(),
            reassigned: 0,
        }
    }

    /// Applies bookmarks and post-load repairs.
    pub fn finish(mut self) {
        let mut dropped = 0;
        for id in self.bookmarks {
            if self.tree.contains(id) {
                self.tree.bookmarks_mut().add(id);
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!("event=bookmarks_prune module=tree status=ok dropped={dropped}");
            self.tree.tracker_mut().mark_bookmarks();
        }
        let repaired = self.tree.repair_shared_groups();
        info!(
            "event=tree_populate module=tree status=ok nodes={} reassigned_ids={} repaired_shared={}",
            self.tree.len(),
            self.reassigned,
            repaired
        );
    }
}

impl NodeSink for PopulateSink<'_> {
    fn node_loaded(
        &mut self,
        mut record: NodeRecord,
        parent: Option<NodeId>,
        sequence: Option<i64>,
    ) -> Result<NodeId, LoadError> {
        if let Some(parent) = parent {
            if !self.tree.contains(parent) {
                return Err(LoadError::corrupt(
                    &self.path,
                    format!("dangling parent reference {parent}"),
                ));
            }
        }

        let reassign = record.id == 0 || self.tree.contains(record.id);
        if reassign {
            let fresh = self.tree.next_id();
            warn!(
                "event=node_id_reassign module=tree status=ok old_id={} new_id={fresh}",
                record.id
            );
            record.id = fresh;
            self.reassigned += 1;
        }

        let last = self
            .tree
            .siblings(parent)
            .last()
            .and_then(|id| self.tree.node(*id))
            .map(|node| node.sequence);
        let sequence = match (sequence, last) {
            (Some(stored), Some(last)) if stored <= last => {
                self.tree.mark_fix_tables();
                last + 1
            }
            (Some(stored), _) => stored,
            (None, Some(last)) => last + 1,
            (None, None) => 1,
        };

        let position = self.tree.siblings(parent).len();
        let id = self.tree.attach(parent, sequence, position, record);
        if reassign {
            self.tree.tracker_mut().mark_new(id);
        }
        Ok(id)
    }

    fn bookmarks_loaded(&mut self, ids: Vec<NodeId>) {
        self.bookmarks = ids;
    }

    fn request_table_fix(&mut self) {
        self.tree.mark_fix_tables();
    }
}

/// Sink grafting a foreign document below `target_parent`.
pub struct ImportSink<'a> {
    tree: &'a mut NoteTree,
    target_parent: Option<NodeId>,
    path: PathBuf,
    source_to_new: HashMap<NodeId, NodeId>,
    new_to_source: HashMap<NodeId, NodeId>,
    grafted_roots: Vec<NodeId>,
    unresolved_members: Vec<(NodeId, NodeId)>,
    /// New id paired with the source id whose body it needs.
    missing_bodies: Vec<(NodeId, NodeId)>,
}

impl<'a> ImportSink<'a> {
    pub fn new(tree: &'a mut NoteTree, target_parent: Option<NodeId>, path: &Path) -> Self {
        Self {
            tree,
            target_parent,
            path: path.to_path_buf(),
            source_to_new: HashMap::new(),
            new_to_source: HashMap::new(),
            grafted_roots: Vec::new(),
            unresolved_members: Vec::new(),
            missing_bodies: Vec::new(),
        }
    }

    /// Loads every body the source backend left non-resident.
    pub fn fetch_bodies(&mut self, backend: &dyn StorageBackend) -> Result<(), LoadError> {
        for (new_id, source_id) in std::mem::take(&mut self.missing_bodies) {
            let Some(body) = backend.fetch_body(source_id)? else {
                continue;
            };
            if let Some(node) = self.tree.node_mut(new_id) {
                node.record.body = Some(body);
            }
        }
        Ok(())
    }

    /// Resolves deferred shared references; returns the grafted top-level ids.
    pub fn finish(mut self) -> Vec<NodeId> {
        for (member, source_master) in std::mem::take(&mut self.unresolved_members) {
            let target = self.source_to_new.get(&source_master).copied();
            self.point_member(member, target);
        }
        self.grafted_roots
    }

    /// Removes everything grafted so far.
    pub fn rollback(mut self) {
        for id in self.new_to_source.keys() {
            if let Some(node) = self.tree.node_mut(*id) {
                node.record.shared_master_id = 0;
            }
        }
        for root in self.grafted_roots.iter().rev() {
            if let Err(err) = self.tree.delete(*root) {
                warn!(
                    "event=subtree_import_rollback module=tree status=error node_id={root} error={err}"
                );
            }
        }
    }

    fn point_member(&mut self, member: NodeId, master: Option<NodeId>) {
        let Some(node) = self.tree.node_mut(member) else {
            return;
        };
        match master {
            Some(master) => {
                node.record.shared_master_id = master;
                node.record.body = None;
            }
            None => {
                node.record.shared_master_id = 0;
                if node.record.body.is_none() {
                    node.record.body = Some(Body::default());
                }
            }
        }
    }
}

impl NodeSink for ImportSink<'_> {
    fn node_loaded(
        &mut self,
        mut record: NodeRecord,
        parent: Option<NodeId>,
        _sequence: Option<i64>,
    ) -> Result<NodeId, LoadError> {
        let is_top_level = parent.is_none();
        let parent = match parent {
            Some(parent) if self.new_to_source.contains_key(&parent) => Some(parent),
            Some(parent) => {
                return Err(LoadError::corrupt(
                    &self.path,
                    format!("dangling parent reference {parent}"),
                ))
            }
            None => self.target_parent,
        };

        let source_id = record.id;
        let new_id = self.tree.next_id();
        record.id = new_id;

        let source_master = record.shared_master_id;
        let mut body_source = (record.body.is_none() && source_master == 0).then_some(source_id);
        if source_master != 0 {
            match self.source_to_new.get(&source_master) {
                Some(master) => record.shared_master_id = *master,
                None => {
                    record.shared_master_id = 0;
                    self.unresolved_members.push((new_id, source_master));
                    body_source = Some(source_master);
                }
            }
        }

        let id = self
            .tree
            .append(parent, record)
            .map_err(|err| LoadError::corrupt(&self.path, err.to_string()))?;
        if source_id != 0 {
            self.source_to_new.insert(source_id, id);
        }
        self.new_to_source.insert(id, source_id);
        if let Some(body_source) = body_source {
            self.missing_bodies.push((id, body_source));
        }
        if is_top_level {
            self.grafted_roots.push(id);
        }
        Ok(id)
    }

    fn bookmarks_loaded(&mut self, _ids: Vec<NodeId>) {}
}
