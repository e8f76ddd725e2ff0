use notetree_core::{
    Body, ContentKind, NodeId, NodeProperty, NodeRecord, NoteTree, TreeError,
};

fn rich(name: &str) -> NodeRecord {
    NodeRecord::new(name, ContentKind::RichText)
}

fn assert_sequences_total(tree: &NoteTree) {
    let mut parents: Vec<Option<NodeId>> = vec![None];
    parents.extend(tree.preorder().into_iter().map(Some));
    for parent in parents {
        let children = tree.children_of(parent).unwrap();
        let sequences: Vec<i64> = children
            .iter()
            .map(|id| tree.sequence_of(*id).unwrap())
            .collect();
        for pair in sequences.windows(2) {
            assert!(
                pair[0] < pair[1],
                "siblings of {parent:?} out of order: {sequences:?}"
            );
        }
        for child in children {
            assert_eq!(tree.parent_of(*child).unwrap(), parent);
        }
    }
}

#[test]
fn move_to_end_reorders_and_cycle_is_rejected() {
    let mut tree = NoteTree::new();
    let root = tree.append(None, rich("R")).unwrap();
    let a = tree.append(Some(root), rich("A")).unwrap();
    let b = tree.append(Some(root), rich("B")).unwrap();
    assert_eq!(tree.sequence_of(a).unwrap(), 1);
    assert_eq!(tree.sequence_of(b).unwrap(), 2);

    tree.move_node(a, Some(root), None).unwrap();
    assert_eq!(tree.children_of(Some(root)).unwrap(), &[b, a]);

    let err = tree.move_node(root, Some(a), None).unwrap_err();
    assert_eq!(
        err,
        TreeError::InvalidMove {
            node: root,
            new_parent: a
        }
    );
}

#[test]
fn rejected_move_leaves_tree_unchanged() {
    let mut tree = NoteTree::new();
    let top = tree.append(None, rich("top")).unwrap();
    let mid = tree.append(Some(top), rich("mid")).unwrap();
    let leaf = tree.append(Some(mid), rich("leaf")).unwrap();
    tree.drain_pending();

    assert!(matches!(
        tree.move_node(top, Some(leaf), None),
        Err(TreeError::InvalidMove { .. })
    ));
    assert!(matches!(
        tree.move_node(mid, Some(mid), None),
        Err(TreeError::InvalidMove { .. })
    ));

    assert_eq!(tree.path_of(leaf).unwrap(), vec![top, mid, leaf]);
    assert_eq!(tree.roots(), &[top]);
    assert!(!tree.is_dirty());
}

#[test]
fn move_before_anchor_validates_anchor() {
    let mut tree = NoteTree::new();
    let first = tree.append(None, rich("first")).unwrap();
    let second = tree.append(None, rich("second")).unwrap();
    let child = tree.append(Some(first), rich("child")).unwrap();

    let err = tree.move_node(second, Some(first), Some(second)).unwrap_err();
    assert!(matches!(err, TreeError::InvalidAnchor { .. }));

    let err = tree.move_node(second, None, Some(child)).unwrap_err();
    assert_eq!(
        err,
        TreeError::InvalidAnchor {
            anchor: child,
            parent: None
        }
    );

    tree.move_node(second, Some(first), Some(child)).unwrap();
    assert_eq!(tree.children_of(Some(first)).unwrap(), &[second, child]);
    assert_sequences_total(&tree);
}

#[test]
fn insert_after_bumps_only_colliding_followers() {
    let mut tree = NoteTree::new();
    let a = tree.append(None, rich("a")).unwrap();
    let b = tree.append(None, rich("b")).unwrap();
    let c = tree.append(None, rich("c")).unwrap();
    tree.move_node(c, None, None).unwrap();
    // a=1, b=2, c=3; leave a gap before c.
    tree.move_node(b, None, None).unwrap();
    tree.drain_pending();

    let inserted = tree.insert_after(rich("x"), a).unwrap();
    assert_eq!(tree.roots(), &[a, inserted, c, b]);
    assert_sequences_total(&tree);

    let pending = tree.pending();
    assert!(pending.node_states[&inserted].is_new);
    assert!(!pending.node_states.contains_key(&a));
}

#[test]
fn sequences_stay_total_under_mixed_edits() {
    let mut tree = NoteTree::new();
    let mut ids = vec![tree.append(None, rich("seed")).unwrap()];
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = |bound: usize| {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state % bound as u64) as usize
    };

    for round in 0..300 {
        let target = ids[next(ids.len())];
        match next(3) {
            0 => ids.push(tree.append(Some(target), rich(&format!("n{round}"))).unwrap()),
            1 => ids.push(tree.insert_after(rich(&format!("n{round}")), target).unwrap()),
            _ => {
                let moved = ids[next(ids.len())];
                let parent = tree.parent_of(target).unwrap();
                let before = if moved == target { None } else { Some(target) };
                let _ = tree.move_node(moved, parent, before);
            }
        }
        assert_sequences_total(&tree);
    }
    assert_eq!(tree.len(), ids.len());
}

#[test]
fn read_only_blocks_content_edits_but_not_presentation() {
    let mut tree = NoteTree::new();
    let id = tree.append(None, rich("locked")).unwrap();
    tree.set_property(id, NodeProperty::ReadOnly(true)).unwrap();

    assert_eq!(
        tree.set_property(id, NodeProperty::Name("renamed".into())),
        Err(TreeError::ReadOnly(id))
    );
    assert_eq!(
        tree.set_body(id, Body::text("new")),
        Err(TreeError::ReadOnly(id))
    );
    tree.set_property(id, NodeProperty::Bold(true)).unwrap();
    assert!(tree.get(id).unwrap().is_bold);
    assert_eq!(tree.get(id).unwrap().name, "locked");
}

#[test]
fn delete_removes_subtree_and_bookmarks() {
    let mut tree = NoteTree::new();
    let keep = tree.append(None, rich("keep")).unwrap();
    let gone = tree.append(None, rich("gone")).unwrap();
    let child = tree.append(Some(gone), rich("child")).unwrap();
    tree.add_bookmark(child).unwrap();
    tree.add_bookmark(keep).unwrap();
    tree.drain_pending();

    let removed = tree.delete(gone).unwrap();
    assert_eq!(removed, vec![gone, child]);
    assert!(!tree.contains(child));
    assert_eq!(tree.bookmarks().as_slice(), &[keep]);

    let pending = tree.drain_pending();
    assert!(pending.bookmarks_dirty);
    assert!(pending.removed_ids.contains(&gone));
    assert!(pending.removed_ids.contains(&child));

    assert_eq!(tree.delete(gone), Err(TreeError::NodeNotFound(gone)));
}

#[test]
fn node_created_and_deleted_between_saves_leaves_no_trace() {
    let mut tree = NoteTree::new();
    let root = tree.append(None, rich("root")).unwrap();
    tree.drain_pending();

    let temp = tree.append(Some(root), rich("temp")).unwrap();
    tree.delete(temp).unwrap();
    assert!(tree.pending().is_empty());
}

#[test]
fn failed_save_restores_pending_changes() {
    let mut tree = NoteTree::new();
    let id = tree.append(None, rich("draft")).unwrap();
    let drained = tree.drain_pending();
    assert!(!tree.is_dirty());

    tree.set_property(id, NodeProperty::Tags("later".into())).unwrap();
    tree.restore_pending(drained);

    let pending = tree.pending();
    assert!(pending.node_states[&id].is_new);
    assert!(pending.node_states[&id].prop_dirty);
}

#[test]
fn explicit_duplicate_id_is_rejected() {
    let mut tree = NoteTree::new();
    let id = tree.append(None, rich("one")).unwrap();
    let mut clash = rich("two");
    clash.id = id;
    assert_eq!(tree.append(None, clash), Err(TreeError::DuplicateId(id)));

    let fresh = tree.append(None, rich("three")).unwrap();
    assert!(fresh > id);
}
