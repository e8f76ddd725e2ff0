//! Node id allocation.

use crate::model::node::NodeId;

/// Issues monotonically increasing node ids.
///
/// # Invariants
/// - Never returns `0`.
/// - Never returns an id lower than or equal to any id issued or observed.
#[derive(Debug, Default, Clone)]
pub struct NodeIdAllocator {
    last: NodeId,
}

impl NodeIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next unused id.
    pub fn next_id(&mut self) -> NodeId {
        self.last += 1;
        self.last
    }

    /// Records an id read from a file so later allocations skip past it.
    pub fn observe(&mut self, id: NodeId) {
        if id > self.last {
            self.last = id;
        }
    }

    /// Highest id issued or observed so far.
    pub fn last_issued(&self) -> NodeId {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::NodeIdAllocator;

    #[test]
    fn next_id_starts_at_one_and_increases() {
        let mut ids = NodeIdAllocator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn observe_seeds_past_loaded_ids() {
        let mut ids = NodeIdAllocator::new();
        ids.observe(40);
        ids.observe(7);
        assert_eq!(ids.last_issued(), 40);
        assert_eq!(ids.next_id(), 41);
    }
}
