//! Ordered bookmark registry.

use crate::model::node::NodeId;

/// Ordered set of bookmarked node ids in display order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bookmarks {
    ids: Vec<NodeId>,
}

impl Bookmarks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `id`; returns `false` if it was already bookmarked.
    pub fn add(&mut self, id: NodeId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Removes `id`; returns `false` if it was not bookmarked.
    pub fn remove(&mut self, id: NodeId) -> bool {
        match self.position(id) {
            Some(index) => {
                self.ids.remove(index);
                true
            }
            None => false,
        }
    }

    /// Replaces `old` by `new` at the same position.
    ///
    /// When `new` is already bookmarked, `old` is simply dropped.
    pub fn replace(&mut self, old: NodeId, new: NodeId) -> bool {
        let Some(index) = self.position(old) else {
            return false;
        };
        if self.contains(new) {
            self.ids.remove(index);
        } else {
            self.ids[index] = new;
        }
        true
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.ids.contains(&id)
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.ids.iter().position(|current| *current == id)
    }

    pub fn as_slice(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Keeps only ids for which `keep` returns `true`; returns removed count.
    pub fn retain(&mut self, mut keep: impl FnMut(NodeId) -> bool) -> usize {
        let before = self.ids.len();
        self.ids.retain(|id| keep(*id));
        before - self.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::Bookmarks;

    #[test]
    fn add_keeps_order_and_rejects_duplicates() {
        let mut bookmarks = Bookmarks::new();
        assert!(bookmarks.add(5));
        assert!(bookmarks.add(2));
        assert!(!bookmarks.add(5));
        assert_eq!(bookmarks.as_slice(), &[5, 2]);
    }

    #[test]
    fn replace_keeps_position() {
        let mut bookmarks = Bookmarks::new();
        bookmarks.add(1);
        bookmarks.add(2);
        bookmarks.add(3);
        assert!(bookmarks.replace(2, 9));
        assert_eq!(bookmarks.as_slice(), &[1, 9, 3]);
        assert!(bookmarks.replace(9, 3));
        assert_eq!(bookmarks.as_slice(), &[1, 3]);
    }
}
