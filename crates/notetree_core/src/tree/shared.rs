//! Shared-node resolution.
//!
//! # Responsibility
//! - Redirect body access of shared members to their master.
//! - Keep group ownership valid when a master is deleted.
//! - Repair groups whose master is missing after a load.
//!
//! # Invariants
//! - A master has `shared_master_id == 0`; members point directly at it.
//! - Body ownership never points at a deleted id.
//! - A member whose master is absent is logged and skipped, never fatal.

use super::{NodeProperty, NoteTree, TreeError, TreeResult};
use crate::model::node::{Body, NodeId, NodeRecord};
use log::{info, warn};
use std::collections::{BTreeMap, HashSet};

impl NoteTree {
    /// Returns the body owner of `id` (`id` itself when unshared).
    ///
    /// A member whose master is absent resolves to itself.
    pub fn resolve_master(&self, id: NodeId) -> TreeResult<NodeId> {
        let master = self.require(id)?.record.shared_master_id;
        if master == 0 {
            return Ok(id);
        }
        if !self.contains(master) {
            warn!(
                "event=shared_group_inconsistent module=tree status=skip node_id={id} master_id={master}"
            );
            return Ok(id);
        }
        Ok(master)
    }

    /// Master id followed by its members in ascending id order.
    pub fn shared_group(&self, id: NodeId) -> TreeResult<Vec<NodeId>> {
        let master = self.resolve_master(id)?;
        let mut group = vec![master];
        group.extend(self.members_of(master));
        Ok(group)
    }

    /// Whether `id` takes part in a group with at least two placements.
    pub fn is_shared(&self, id: NodeId) -> TreeResult<bool> {
        Ok(self.shared_group(id)?.len() > 1)
    }

    /// Appends a new placement of `source`'s body under `parent`.
    pub fn append_shared(&mut self, parent: Option<NodeId>, source: NodeId) -> TreeResult<NodeId> {
        let master = self.resolve_master(source)?;
        let master_record = &self.require(master)?.record;
        let mut member = NodeRecord::new(
            master_record.name.clone(),
            master_record.content_kind.clone(),
        );
        member.copy_scalars_from(master_record);
        member.shared_master_id = master;
        member.body = None;
        self.append(parent, member)
    }

    /// Applies `property` to every placement of the group containing `id`.
    ///
    /// Returns the touched ids. Read-only checks use the master's flag.
    pub fn set_property_shared(
        &mut self,
        id: NodeId,
        property: NodeProperty,
    ) -> TreeResult<Vec<NodeId>> {
        let group = self.shared_group(id)?;
        let master = group[0];
        if property.respects_read_only() && self.require(master)?.record.is_read_only {
            return Err(TreeError::ReadOnly(master));
        }
        for member in &group {
            if let Some(node) = self.node_mut(*member) {
                property.apply(&mut node.record);
            }
            self.tracker.mark_prop(*member);
        }
        Ok(group)
    }

    /// For every master in `removed` with members outside `doomed`, returns
    /// the surviving members, checking that the master body is resident.
    pub(super) fn plan_master_handovers(
        &self,
        removed: &[NodeId],
        doomed: &HashSet<NodeId>,
    ) -> TreeResult<Vec<(NodeId, Vec<NodeId>)>> {
        let mut plan = Vec::new();
        for id in removed {
            let record = &self.require(*id)?.record;
            if record.is_shared_member() {
                continue;
            }
            let survivors: Vec<NodeId> = self
                .members_of(*id)
                .into_iter()
                .filter(|member| !doomed.contains(member))
                .collect();
            if survivors.is_empty() {
                continue;
            }
            if record.body.is_none() {
                return Err(TreeError::BodyNotResident(*id));
            }
            plan.push((*id, survivors));
        }
        Ok(plan)
    }

    /// Moves body ownership from `master` to the lowest surviving member.
    pub(super) fn promote_master(&mut self, master: NodeId, survivors: &[NodeId]) {
        let Some(promoted) = survivors.iter().copied().min() else {
            return;
        };
        let Some(master_record) = self.get(master).cloned() else {
            return;
        };

        if let Some(node) = self.node_mut(promoted) {
            node.record.copy_scalars_from(&master_record);
            node.record.body = master_record.body.clone();
            node.record.shared_master_id = 0;
        }
        self.tracker.mark_prop(promoted);
        self.tracker.mark_body(promoted);
        self.tracker.mark_hierarchy(promoted);

        for member in survivors.iter().copied().filter(|member| *member != promoted) {
            match self.node_mut(member) {
                Some(node) => node.record.shared_master_id = promoted,
                None => {
                    warn!(
                        "event=shared_group_inconsistent module=tree status=skip node_id={member} master_id={master}"
                    );
                    continue;
                }
            }
            self.tracker.mark_prop(member);
            self.tracker.mark_hierarchy(member);
        }

        if self.bookmarks.replace(master, promoted) {
            self.tracker.mark_bookmarks();
        }
        info!(
            "event=shared_master_promote module=tree status=ok old_master_id={master} new_master_id={promoted} members={}",
            survivors.len()
        );
    }

    /// Fixes groups left inconsistent by a load.
    ///
    /// Members of a member are pointed at the final master; members whose
    /// master is absent are detached into standalone nodes with an empty
    /// body. Returns the number of repaired nodes.
    pub(crate) fn repair_shared_groups(&mut self) -> usize {
        let mut repairs: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        for id in self.preorder() {
            let Some(record) = self.get(id) else {
                continue;
            };
            let master = record.shared_master_id;
            if master == 0 {
                continue;
            }
            let target = match self.get(master) {
                None => 0,
                Some(master_record) if master_record.shared_master_id == 0 => continue,
                Some(master_record) => {
                    let upper = master_record.shared_master_id;
                    match self.get(upper) {
                        Some(upper_record)
                            if upper_record.shared_master_id == 0 && upper != id =>
                        {
                            upper
                        }
                        _ => 0,
                    }
                }
            };
            repairs.insert(id, target);
        }

        for (id, target) in &repairs {
            warn!(
                "event=shared_group_repair module=tree status=ok node_id={id} new_master_id={target}"
            );
            if let Some(node) = self.node_mut(*id) {
                node.record.shared_master_id = *target;
                if *target == 0 && node.record.body.is_none() {
                    node.record.body = Some(Body::default());
                }
            }
            self.tracker.mark_prop(*id);
            self.tracker.mark_hierarchy(*id);
            if *target == 0 {
                self.tracker.mark_body(*id);
            }
        }
        repairs.len()
    }

    fn members_of(&self, master: NodeId) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self
            .index
            .keys()
            .copied()
            .filter(|id| {
                self.get(*id)
                    .is_some_and(|record| record.shared_master_id == master)
            })
            .collect();
        members.sort_unstable();
        members
    }
}
