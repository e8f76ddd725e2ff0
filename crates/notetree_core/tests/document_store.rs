use notetree_core::service::backup::{backup_path, staged_path};
use notetree_core::{
    Body, ContentKind, DocType, Document, DocumentError, NodeId, NodeProperty, NodeRecord,
    StorageConfig,
};
use std::fs;
use std::path::Path;

fn note(name: &str, text: &str) -> NodeRecord {
    NodeRecord::new(name, ContentKind::RichText).with_body(Body::text(text))
}

fn rename_first_root(document: &mut Document, name: &str) {
    let root = document.tree().roots()[0];
    document
        .tree_mut()
        .set_property(root, NodeProperty::Name(name.into()))
        .unwrap();
}

/// Reads `payload` as a document of `path`'s format.
fn first_root_name(path: &Path, payload: &Path) -> String {
    let document =
        Document::open_payload(path, payload, StorageConfig::without_backups()).unwrap();
    let root = document.tree().roots()[0];
    document.tree().get(root).unwrap().name.clone()
}

#[test]
fn saves_rotate_tilde_backups() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rotating.ctd");
    let config = StorageConfig {
        backup_num: 2,
        ..StorageConfig::default()
    };

    let mut document = Document::create(&path, config.clone()).unwrap();
    document.tree_mut().append(None, note("v1", "")).unwrap();
    document.save().unwrap();
    assert!(!backup_path(&path, &config, 1).exists());

    for version in ["v2", "v3", "v4"] {
        rename_first_root(&mut document, version);
        document.save().unwrap();
    }
    document.close();

    assert_eq!(first_root_name(&path, &path), "v4");
    assert_eq!(first_root_name(&path, &backup_path(&path, &config, 1)), "v3");
    assert_eq!(first_root_name(&path, &backup_path(&path, &config, 2)), "v2");
    assert!(!backup_path(&path, &config, 3).exists());
    assert!(!staged_path(&path).exists());
}

#[test]
fn clean_document_skips_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clean.ctd");
    let mut document = Document::create(&path, StorageConfig::default()).unwrap();
    assert!(document.is_dirty());
    document.tree_mut().append(None, note("only", "x")).unwrap();
    document.save().unwrap();
    assert!(!document.is_dirty());

    document.save().unwrap();
    assert!(!backup_path(&path, document.config(), 1).exists());
}

#[test]
fn failed_save_keeps_file_and_pending_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blocked.ctd");
    let mut document = Document::create(&path, StorageConfig::default()).unwrap();
    document.tree_mut().append(None, note("stable", "")).unwrap();
    document.save().unwrap();
    let before = fs::read(&path).unwrap();

    rename_first_root(&mut document, "unsaved");
    fs::create_dir(dir.path().join("blocked.ctd.tmp")).unwrap();
    let err = document.save().unwrap_err();
    assert!(matches!(err, DocumentError::Save(_)), "unexpected error: {err}");

    assert_eq!(fs::read(&path).unwrap(), before);
    assert!(document.is_dirty());
    assert!(!staged_path(&path).exists());
    assert!(!backup_path(&path, document.config(), 1).exists());

    fs::remove_dir(dir.path().join("blocked.ctd.tmp")).unwrap();
    document.save().unwrap();
    document.close();
    assert_eq!(first_root_name(&path, &path), "unsaved");
}

#[test]
fn save_as_switches_format_and_keeps_content() {
    let dir = tempfile::tempdir().unwrap();
    let xml_path = dir.path().join("source.ctd");
    let db_path = dir.path().join("copy.ctb");

    let mut document = Document::create(&xml_path, StorageConfig::without_backups()).unwrap();
    let root = document.tree_mut().append(None, note("root", "body")).unwrap();
    let child = document
        .tree_mut()
        .append(Some(root), note("child", "child body"))
        .unwrap();
    document.save().unwrap();

    document.save_as(&db_path).unwrap();
    assert_eq!(document.format().doc_type, DocType::Sqlite);
    assert_eq!(document.path(), db_path.as_path());
    assert!(!document.is_dirty());

    document
        .tree_mut()
        .set_body(child, Body::text("edited in copy"))
        .unwrap();
    document.save().unwrap();
    document.close();

    let mut copy = Document::open(&db_path, StorageConfig::without_backups()).unwrap();
    assert_eq!(copy.body(child).unwrap().text, "edited in copy");
    assert_eq!(copy.body(root).unwrap().text, "body");

    let mut original = Document::open(&xml_path, StorageConfig::without_backups()).unwrap();
    assert_eq!(original.body(child).unwrap().text, "child body");
}

#[test]
fn save_as_from_lazy_database_carries_unloaded_bodies() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("lazy.ctb");
    let xml_path = dir.path().join("export.ctd");

    let mut document = Document::create(&db_path, StorageConfig::without_backups()).unwrap();
    let id = document.tree_mut().append(None, note("n", "stored text")).unwrap();
    document.save().unwrap();
    document.close();

    let mut reopened = Document::open(&db_path, StorageConfig::without_backups()).unwrap();
    assert!(reopened.tree().get(id).unwrap().body.is_none());
    reopened.save_as(&xml_path).unwrap();
    reopened.close();

    let mut exported = Document::open(&xml_path, StorageConfig::without_backups()).unwrap();
    assert_eq!(exported.body(id).unwrap().text, "stored text");
}

#[test]
fn format_is_chosen_from_extension() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default();

    let err = Document::create(dir.path().join("notes.txt"), config.clone()).unwrap_err();
    assert!(matches!(err, DocumentError::UnsupportedFormat(_)));
    let err = Document::create(dir.path().join("notes.ctz"), config.clone()).unwrap_err();
    assert!(matches!(err, DocumentError::WrappedPayloadRequired(_)));
    let err = Document::open(dir.path().join("notes.ctx"), config.clone()).unwrap_err();
    assert!(matches!(err, DocumentError::WrappedPayloadRequired(_)));

    let document = Document::create(dir.path().join("NOTES.CTB"), config).unwrap();
    assert_eq!(document.format().doc_type, DocType::Sqlite);
    assert!(!document.format().is_wrapped);
}

#[test]
fn wrapped_document_reads_and_writes_its_payload() {
    let dir = tempfile::tempdir().unwrap();
    let payload = dir.path().join("unwrapped.payload");
    let wrapped = dir.path().join("secret.ctz");

    let mut staging =
        Document::create(dir.path().join("seed.ctd"), StorageConfig::without_backups()).unwrap();
    staging.tree_mut().append(None, note("inside", "hidden")).unwrap();
    staging.save().unwrap();
    fs::copy(staging.path(), &payload).unwrap();
    staging.close();

    let mut document =
        Document::open_payload(&wrapped, &payload, StorageConfig::without_backups()).unwrap();
    assert!(document.format().is_wrapped);
    assert_eq!(document.format().doc_type, DocType::Xml);
    rename_first_root(&mut document, "changed");
    document.save().unwrap();
    document.close();

    assert!(!wrapped.exists());
    let reread =
        Document::open_payload(&wrapped, &payload, StorageConfig::without_backups()).unwrap();
    let root = reread.tree().roots()[0];
    assert_eq!(reread.tree().get(root).unwrap().name, "changed");
}

#[test]
fn import_grafts_other_document_with_fresh_ids() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("source.ctb");
    let target_path = dir.path().join("target.ctd");

    let mut source = Document::create(&source_path, StorageConfig::without_backups()).unwrap();
    let folder = source.tree_mut().append(None, note("folder", "")).unwrap();
    let master = source
        .tree_mut()
        .append(Some(folder), note("master", "shared body"))
        .unwrap();
    source.tree_mut().append_shared(None, master).unwrap();
    source.save().unwrap();
    source.close();

    let mut target = Document::create(&target_path, StorageConfig::without_backups()).unwrap();
    let anchor = target.tree_mut().append(None, note("anchor", "")).unwrap();
    let existing: Vec<NodeId> = target.tree().preorder();

    let grafted = target.import(&source_path, Some(anchor)).unwrap();
    assert_eq!(grafted.len(), 2);
    assert_eq!(target.tree().children_of(Some(anchor)).unwrap(), grafted.as_slice());
    for id in target.tree().subtree_of(anchor).unwrap().into_iter().skip(1) {
        assert!(!existing.contains(&id));
    }

    let new_folder = grafted[0];
    let new_master = target.tree().children_of(Some(new_folder)).unwrap()[0];
    let new_member = grafted[1];
    assert_eq!(
        target.tree().get(new_member).unwrap().shared_master_id,
        new_master
    );
    assert_eq!(target.body(new_member).unwrap().text, "shared body");

    target.save().unwrap();
    target.close();
    let mut reopened = Document::open(&target_path, StorageConfig::without_backups()).unwrap();
    assert_eq!(reopened.tree().len(), 4);
    assert_eq!(reopened.body(new_master).unwrap().text, "shared body");
}

#[test]
fn failed_import_leaves_tree_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let broken = dir.path().join("broken.ctd");
    fs::write(
        &broken,
        "<?xml version=\"1.0\"?><notetree><node name=\"ok\" unique_id=\"1\"/>\
         <node name=\"bad\" unique_id=\"nope\"/></notetree>",
    )
    .unwrap();

    let mut target =
        Document::create(dir.path().join("target.ctd"), StorageConfig::without_backups()).unwrap();
    let anchor = target.tree_mut().append(None, note("anchor", "")).unwrap();
    target.save().unwrap();

    let err = target.import(&broken, Some(anchor)).unwrap_err();
    assert!(matches!(err, DocumentError::Import(_)), "unexpected error: {err}");
    assert_eq!(target.tree().len(), 1);
    assert!(!target.is_dirty());
}

#[test]
fn config_deserializes_with_defaults() {
    let config: StorageConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config, StorageConfig::default());
    assert!(config.backup_copy);
    assert_eq!(config.backup_num, 3);
    assert_eq!(config.sqlite_busy_timeout_ms, 5_000);

    let partial: StorageConfig =
        serde_json::from_str(r#"{"backup_num": 7, "custom_backup_dir": "/tmp/backups"}"#).unwrap();
    assert_eq!(partial.backup_num, 7);
    assert_eq!(
        partial.custom_backup_dir.as_deref(),
        Some(Path::new("/tmp/backups"))
    );
    assert_eq!(partial.xml_indent, 1);

    let encoded = serde_json::to_string(&partial).unwrap();
    let decoded: StorageConfig = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, partial);
}
