use notetree_core::db::schema::{column_exists, table_exists};
use notetree_core::model::flags::{pack_read_only_icon, pack_style, StyleFlags};
use notetree_core::storage::{SqliteBackend, StorageBackend};
use notetree_core::tree::load::PopulateSink;
use notetree_core::{
    Body, ContentKind, Document, DocumentError, LoadError, NodeProperty, NodeRecord, NoteTree,
    Rgb, StorageConfig,
};
use rusqlite::Connection;
use std::path::Path;

fn sample_tree() -> NoteTree {
    let mut tree = NoteTree::new();
    let root = tree
        .append(
            None,
            NodeRecord::new("root", ContentKind::RichText).with_body(Body::text("root body")),
        )
        .unwrap();
    for index in 0..3 {
        tree.append(
            Some(root),
            NodeRecord::new(format!("child {index}"), ContentKind::PlainText),
        )
        .unwrap();
    }
    tree.add_bookmark(root).unwrap();
    tree
}

fn children_rows(path: &Path) -> Vec<(i64, i64, i64)> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare("SELECT node_id, father_id, sequence FROM children ORDER BY father_id, sequence")
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

#[test]
fn second_save_without_changes_writes_zero_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idle.ctb");
    let mut tree = sample_tree();
    let mut backend = SqliteBackend::new(StorageConfig::without_backups());

    let pending = tree.drain_pending();
    backend.save(&path, &tree, &pending, true).unwrap();
    assert!(backend.rows_written_last_save() > 0);

    let pending = tree.drain_pending();
    assert!(pending.is_empty());
    backend.save(&path, &tree, &pending, false).unwrap();
    assert_eq!(backend.rows_written_last_save(), 0);

    let child = tree.children_of(tree.roots().first().copied()).unwrap()[1];
    tree.set_property(child, NodeProperty::Tags("one".into()))
        .unwrap();
    let pending = tree.drain_pending();
    backend.save(&path, &tree, &pending, false).unwrap();
    assert_eq!(backend.rows_written_last_save(), 1);
    backend.close();
}

#[test]
fn populate_leaves_bodies_on_disk_until_requested() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lazy.ctb");
    let mut document = Document::create(&path, StorageConfig::without_backups()).unwrap();
    *document.tree_mut() = sample_tree();
    document.save().unwrap();
    let root = document.tree().roots()[0];
    document.close();

    let mut reopened = Document::open(&path, StorageConfig::without_backups()).unwrap();
    assert!(reopened.tree().get(root).unwrap().body.is_none());
    assert_eq!(reopened.body(root).unwrap().text, "root body");
    assert!(reopened.tree().get(root).unwrap().body.is_some());
    assert!(!reopened.is_dirty());
}

#[test]
fn populate_sink_accepts_backend_enumeration() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sink.ctb");
    let mut source = sample_tree();
    let pending = source.drain_pending();
    let mut backend = SqliteBackend::new(StorageConfig::without_backups());
    backend.save(&path, &source, &pending, true).unwrap();
    backend.close();

    let mut tree = NoteTree::new();
    let mut sink = PopulateSink::new(&mut tree, &path);
    backend.populate(&path, &mut sink).unwrap();
    sink.finish();

    assert_eq!(tree.preorder(), source.preorder());
    assert_eq!(tree.bookmarks().as_slice(), source.bookmarks().as_slice());
    let root = tree.roots()[0];
    assert_eq!(
        backend.fetch_body(root).unwrap().unwrap().text,
        "root body"
    );
}

fn write_old_schema_file(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE node (node_id INTEGER UNIQUE, name TEXT, txt TEXT, syntax TEXT,
            tags TEXT, is_ro INTEGER, is_richtxt INTEGER, has_codebox INTEGER,
            has_table INTEGER, has_image INTEGER, level INTEGER);
         CREATE TABLE children (node_id INTEGER UNIQUE, father_id INTEGER, sequence INTEGER);",
    )
    .unwrap();
    let style = pack_style(StyleFlags {
        is_rich_text: true,
        is_bold: true,
        foreground: Some(Rgb::new(0x11, 0x22, 0x33)),
    });
    let nodes: [(i64, &str, &str, i64, i64); 3] = [
        (1, "alpha", "custom-colors", pack_read_only_icon(true, 3), style),
        (2, "beta", "plain-text", 0, 0),
        (3, "gamma", "sh", 0, 0),
    ];
    for (id, name, syntax, is_ro, is_richtxt) in nodes {
        conn.execute(
            "INSERT INTO node VALUES (?1, ?2, 'text', ?3, '', ?4, ?5, 0, 0, 0, 0)",
            rusqlite::params![id, name, syntax, is_ro, is_richtxt],
        )
        .unwrap();
    }
    conn.execute_batch(
        "INSERT INTO children VALUES (1, 0, 1);
         INSERT INTO children VALUES (2, 0, 1);
         INSERT INTO children VALUES (3, 1, 7);",
    )
    .unwrap();
}

#[test]
fn old_files_load_with_defaults_and_are_repaired_on_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("old.ctb");
    write_old_schema_file(&path);

    let mut document = Document::open(&path, StorageConfig::without_backups()).unwrap();
    assert!(document.tree().pending().fix_tables);
    assert_eq!(document.tree().roots(), &[1, 2]);
    assert!(document.tree().sequence_of(2).unwrap() > document.tree().sequence_of(1).unwrap());
    assert_eq!(document.tree().children_of(Some(1)).unwrap(), &[3]);

    let alpha = document.tree().get(1).unwrap().clone();
    assert!(alpha.is_read_only);
    assert_eq!(alpha.custom_icon_id, 3);
    assert!(alpha.is_bold);
    assert_eq!(alpha.foreground, Some(Rgb::new(0x11, 0x22, 0x33)));
    assert_eq!(alpha.created_at, 0);
    assert_eq!(
        document.tree().get(3).unwrap().content_kind,
        ContentKind::Code("sh".into())
    );
    assert_eq!(document.body(3).unwrap().text, "text");

    document.save().unwrap();
    document.close();

    let conn = Connection::open(&path).unwrap();
    assert!(column_exists(&conn, "node", "ts_creation").unwrap());
    assert!(column_exists(&conn, "children", "master_id").unwrap());
    assert!(table_exists(&conn, "bookmark").unwrap());
    assert!(table_exists(&conn, "image").unwrap());
    drop(conn);

    let sequences: Vec<i64> = children_rows(&path)
        .into_iter()
        .filter(|(_, father, _)| *father == 0)
        .map(|(_, _, sequence)| sequence)
        .collect();
    assert_eq!(sequences.len(), 2);
    assert!(sequences[0] < sequences[1]);

    let reopened = Document::open(&path, StorageConfig::without_backups()).unwrap();
    assert!(!reopened.is_dirty());
    assert_eq!(reopened.tree().roots(), &[1, 2]);
}

#[test]
fn node_created_before_repair_save_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repair_new.ctb");
    write_old_schema_file(&path);

    let mut document = Document::open(&path, StorageConfig::without_backups()).unwrap();
    assert!(document.tree().pending().fix_tables);
    let added = document
        .tree_mut()
        .append(
            Some(1),
            NodeRecord::new("added", ContentKind::RichText).with_body(Body::text("fresh body")),
        )
        .unwrap();
    document.save().unwrap();
    document.close();

    let row_count: i64 = Connection::open(&path)
        .unwrap()
        .query_row(
            "SELECT COUNT(*) FROM children WHERE node_id = ?1",
            [added as i64],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(row_count, 1);

    let mut reopened = Document::open(&path, StorageConfig::without_backups()).unwrap();
    assert_eq!(reopened.tree().children_of(Some(1)).unwrap(), &[3, added]);
    assert_eq!(reopened.tree().get(added).unwrap().name, "added");
    assert_eq!(reopened.body(added).unwrap().text, "fresh body");
}

fn assert_corrupt(path: &Path) {
    let err = Document::open(path, StorageConfig::default()).unwrap_err();
    assert!(
        matches!(err, DocumentError::Load(LoadError::Corrupt { .. })),
        "unexpected error: {err}"
    );
}

#[test]
fn unreadable_databases_are_corrupt() {
    let dir = tempfile::tempdir().unwrap();

    let garbage = dir.path().join("garbage.ctb");
    std::fs::write(&garbage, "not a database, just text\n".repeat(64)).unwrap();
    assert_corrupt(&garbage);

    let no_tables = dir.path().join("empty.ctb");
    Connection::open(&no_tables)
        .unwrap()
        .execute_batch("CREATE TABLE unrelated (x INTEGER);")
        .unwrap();
    assert_corrupt(&no_tables);

    let dangling = dir.path().join("dangling.ctb");
    write_old_schema_file(&dangling);
    Connection::open(&dangling)
        .unwrap()
        .execute_batch("INSERT INTO children VALUES (42, 0, 9);")
        .unwrap();
    assert_corrupt(&dangling);

    let future = dir.path().join("future.ctb");
    write_old_schema_file(&future);
    Connection::open(&future)
        .unwrap()
        .execute_batch("PRAGMA user_version = 999;")
        .unwrap();
    assert_corrupt(&future);
}

#[test]
fn vacuum_keeps_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("compact.ctb");
    let mut document = Document::create(&path, StorageConfig::without_backups()).unwrap();
    *document.tree_mut() = sample_tree();
    document.save().unwrap();

    let root = document.tree().roots()[0];
    let doomed = document.tree().children_of(Some(root)).unwrap()[0];
    document.delete_node(doomed).unwrap();
    document.save().unwrap();
    document.vacuum().unwrap();
    document.close();

    let mut reopened = Document::open(&path, StorageConfig::without_backups()).unwrap();
    assert_eq!(reopened.tree().len(), 3);
    assert_eq!(reopened.body(root).unwrap().text, "root body");
}
