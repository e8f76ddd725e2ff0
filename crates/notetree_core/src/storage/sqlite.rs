//! SQLite document backend: incremental saves and lazy bodies.
//!
//! # Responsibility
//! - Enumerate the `children` hierarchy into a sink without reading bodies.
//! - Load one node body with its anchored objects on demand.
//! - Apply a `SyncPending` batch as row-level changes in one transaction.
//! - Build complete databases for full rewrites.
//!
//! # Invariants
//! - An incremental save commits completely or not at all.
//! - A full rewrite builds a sibling temporary file and renames it over the
//!   target, so the previous file survives any failure.
//! - An empty `SyncPending` touches no rows.

use super::{temp_sibling, LoadError, NodeSink, SaveError, StorageBackend};
use crate::config::StorageConfig;
use crate::db::migrations::apply_migrations;
use crate::db::{create_db, open_db, schema, DbError};
use crate::model::flags::{
    pack_read_only_icon, pack_search_exclusion, pack_style, unpack_read_only_icon,
    unpack_search_exclusion, unpack_style, StyleFlags,
};
use crate::model::node::{
    AnchoredKind, AnchoredObject, AnchoredPayload, Body, ContentKind, Justification, NodeId,
    NodeRecord,
};
use crate::tree::sync::{NodeSyncState, SyncPending};
use crate::tree::NoteTree;
use log::{debug, error, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

const AUX_TABLES: &[&str] = &["codebox", "grid", "image"];

/// Which optional schema parts the open file provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ColumnSupport {
    node_timestamps: bool,
    image_extras: bool,
    children_master: bool,
    bookmark_table: bool,
    codebox_table: bool,
    grid_table: bool,
    image_table: bool,
}

impl ColumnSupport {
    fn full() -> Self {
        Self {
            node_timestamps: true,
            image_extras: true,
            children_master: true,
            bookmark_table: true,
            codebox_table: true,
            grid_table: true,
            image_table: true,
        }
    }

    fn detect(conn: &Connection) -> Result<Self, DbError> {
        let image_table = schema::table_exists(conn, "image")?;
        Ok(Self {
            node_timestamps: schema::column_exists(conn, "node", "ts_creation")?
                && schema::column_exists(conn, "node", "ts_lastsave")?,
            image_extras: image_table
                && schema::column_exists(conn, "image", "filename")?
                && schema::column_exists(conn, "image", "link")?
                && schema::column_exists(conn, "image", "time")?,
            children_master: schema::column_exists(conn, "children", "master_id")?,
            bookmark_table: schema::table_exists(conn, "bookmark")?,
            codebox_table: schema::table_exists(conn, "codebox")?,
            grid_table: schema::table_exists(conn, "grid")?,
            image_table,
        })
    }
}

/// Incremental codec for `.ctb` / `.ctx` payloads.
pub struct SqliteBackend {
    config: StorageConfig,
    conn: Option<Connection>,
    conn_path: Option<PathBuf>,
    support: ColumnSupport,
    rows_written: usize,
}

impl SqliteBackend {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            conn: None,
            conn_path: None,
            support: ColumnSupport::full(),
            rows_written: 0,
        }
    }

    /// Rows inserted, updated or deleted by the last successful save.
    pub fn rows_written_last_save(&self) -> usize {
        self.rows_written
    }

    fn is_open_at(&self, path: &Path) -> bool {
        self.conn.is_some() && self.conn_path.as_deref() == Some(path)
    }

    fn corrupt_error(&self, message: impl Into<String>) -> LoadError {
        let path = self.conn_path.clone().unwrap_or_default();
        LoadError::Corrupt {
            path,
            message: message.into(),
        }
    }

    fn full_rewrite(&mut self, path: &Path, tree: &NoteTree) -> Result<usize, SaveError> {
        let temp_path = temp_sibling(path);
        if temp_path.exists() {
            std::fs::remove_file(&temp_path).map_err(|err| SaveError::io(&temp_path, err))?;
        }

        let written = {
            let mut fresh = create_db(&temp_path, self.config.busy_timeout())
                .map_err(|err| SaveError::Backend(err.to_string()))?;
            let previous = self.conn.as_ref().filter(|_| self.conn_path.as_deref() == Some(path));
            let result = write_everything(&mut fresh, tree, previous, self.support);
            drop(fresh);
            match result {
                Ok(written) => written,
                Err(err) => {
                    let _ = std::fs::remove_file(&temp_path);
                    return Err(err);
                }
            }
        };

        if self.conn_path.as_deref() == Some(path) {
            self.close();
        }
        if let Err(err) = std::fs::rename(&temp_path, path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(SaveError::io(path, err));
        }

        let conn = open_db(path, self.config.busy_timeout())
            .map_err(|err| SaveError::Backend(err.to_string()))?;
        self.conn = Some(conn);
        self.conn_path = Some(path.to_path_buf());
        self.support = ColumnSupport::full();
        Ok(written)
    }

    fn incremental(
        &mut self,
        tree: &NoteTree,
        pending: &SyncPending,
    ) -> Result<usize, SaveError> {
        let support = self.support;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| SaveError::Backend("database is not open".to_string()))?;

        let mut support = support;
        if pending.fix_tables {
            apply_migrations(conn).map_err(|err| SaveError::Backend(err.to_string()))?;
            let repaired =
                schema::repair_tables(conn).map_err(|err| SaveError::Backend(err.to_string()))?;
            if !repaired.is_empty() {
                info!(
                    "event=db_repair module=sqlite status=ok columns={}",
                    repaired.join(",")
                );
            }
            support = ColumnSupport::full();
        }

        let tx = conn.transaction()?;
        let mut written = 0usize;

        for id in &pending.removed_ids {
            written += delete_node_rows(&tx, *id)?;
        }

        if pending.fix_tables {
            written += tx.execute("DELETE FROM children", [])?;
            for id in tree.preorder() {
                written += insert_children_row(&tx, tree, id)?;
            }
        }

        for (id, state) in &pending.node_states {
            if !tree.contains(*id) {
                warn!("event=node_sync module=sqlite status=skip node_id={id} reason=not_in_tree");
                continue;
            }
            written += apply_node_state(&tx, tree, *id, *state, pending.fix_tables, support)?;
        }

        if pending.bookmarks_dirty {
            written += write_bookmarks(&tx, tree)?;
        }

        tx.commit()?;
        self.support = support;
        Ok(written)
    }
}

impl StorageBackend for SqliteBackend {
    fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn populate(&mut self, path: &Path, sink: &mut dyn NodeSink) -> Result<(), LoadError> {
        let started_at = Instant::now();
        self.close();
        std::fs::metadata(path).map_err(|err| LoadError::io(path, err))?;

        let conn = open_db(path, self.config.busy_timeout())
            .map_err(|err| LoadError::corrupt(path, err.to_string()))?;
        schema::quick_check(&conn).map_err(|err| LoadError::corrupt(path, err.to_string()))?;
        for table in schema::REQUIRED_TABLES {
            let exists = schema::table_exists(&conn, table)
                .map_err(|err| LoadError::corrupt(path, err.to_string()))?;
            if !exists {
                return Err(LoadError::corrupt(path, format!("missing table `{table}`")));
            }
        }
        let needs_repair =
            schema::needs_repair(&conn).map_err(|err| LoadError::corrupt(path, err.to_string()))?;
        if needs_repair {
            info!("event=db_repair module=sqlite status=start reason=missing_schema_parts");
            sink.request_table_fix();
        }
        let support =
            ColumnSupport::detect(&conn).map_err(|err| LoadError::corrupt(path, err.to_string()))?;

        let mut walk = HierarchyWalk {
            conn: &conn,
            path,
            support,
            visited: HashSet::new(),
        };
        walk.load_all(sink)?;
        let loaded = walk.visited.len();

        if support.bookmark_table {
            let bookmarks = read_bookmarks(&conn)
                .map_err(|err| LoadError::corrupt(path, err.to_string()))?;
            sink.bookmarks_loaded(bookmarks);
        }

        self.conn = Some(conn);
        self.conn_path = Some(path.to_path_buf());
        self.support = support;
        info!(
            "event=doc_populate module=sqlite status=ok nodes={loaded} duration_ms={}",
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    fn save(
        &mut self,
        path: &Path,
        tree: &NoteTree,
        pending: &SyncPending,
        full_rewrite: bool,
    ) -> Result<(), SaveError> {
        let started_at = Instant::now();
        let full = full_rewrite || !self.is_open_at(path);
        if !full && pending.is_empty() {
            self.rows_written = 0;
            debug!("event=doc_save module=sqlite status=skip reason=nothing_pending");
            return Ok(());
        }

        let result = if full {
            self.full_rewrite(path, tree)
        } else {
            self.incremental(tree, pending)
        };
        match result {
            Ok(written) => {
                self.rows_written = written;
                info!(
                    "event=doc_save module=sqlite status=ok mode={} rows={written} duration_ms={}",
                    if full { "full" } else { "incremental" },
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=doc_save module=sqlite status=error mode={} duration_ms={} error={err}",
                    if full { "full" } else { "incremental" },
                    started_at.elapsed().as_millis()
                );
                Err(err)
            }
        }
    }

    fn vacuum(&mut self, path: &Path) -> Result<(), SaveError> {
        let started_at = Instant::now();
        if !self.is_open_at(path) {
            self.close();
            let conn = open_db(path, self.config.busy_timeout())
                .map_err(|err| SaveError::Backend(err.to_string()))?;
            self.support =
                ColumnSupport::detect(&conn).map_err(|err| SaveError::Backend(err.to_string()))?;
            self.conn = Some(conn);
            self.conn_path = Some(path.to_path_buf());
        }
        if let Some(conn) = self.conn.as_ref() {
            conn.execute_batch("VACUUM;")?;
        }
        info!(
            "event=doc_vacuum module=sqlite status=ok duration_ms={}",
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    fn fetch_body(&self, id: NodeId) -> Result<Option<Body>, LoadError> {
        let Some(conn) = self.conn.as_ref() else {
            return Ok(None);
        };
        read_body(conn, id, self.support).map_err(|err| {
            self.corrupt_error(format!("cannot read body of node {id}: {err}"))
        })
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, err)) = conn.close() {
                warn!("event=db_close module=sqlite status=error error={err}");
            }
        }
        self.conn_path = None;
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// One `children` row waiting to be reported.
struct ChildRow {
    node_id: i64,
    father_id: i64,
    sequence: i64,
    master_id: i64,
    parent: Option<NodeId>,
}

struct HierarchyWalk<'a> {
    conn: &'a Connection,
    path: &'a Path,
    support: ColumnSupport,
    visited: HashSet<i64>,
}

impl HierarchyWalk<'_> {
    /// Reports every node reachable from father 0, parents first and
    /// siblings in `sequence` order.
    fn load_all(&mut self, sink: &mut dyn NodeSink) -> Result<(), LoadError> {
        let mut stack: Vec<ChildRow> = Vec::new();
        self.push_children(0, None, &mut stack)?;
        while let Some(row) = stack.pop() {
            if row.node_id <= 0 {
                return Err(LoadError::corrupt(
                    self.path,
                    format!("invalid node id {} under {}", row.node_id, row.father_id),
                ));
            }
            if !self.visited.insert(row.node_id) {
                warn!(
                    "event=doc_populate module=sqlite status=skip node_id={} reason=revisited",
                    row.node_id
                );
                continue;
            }

            let mut record = self.node_record(row.node_id, row.master_id)?;
            record.shared_master_id = u64::try_from(row.master_id).unwrap_or(0);
            let id = sink.node_loaded(record, row.parent, Some(row.sequence))?;
            self.push_children(row.node_id, Some(id), &mut stack)?;
        }
        Ok(())
    }

    fn push_children(
        &self,
        father_id: i64,
        parent: Option<NodeId>,
        stack: &mut Vec<ChildRow>,
    ) -> Result<(), LoadError> {
        let rows = self
            .children_rows(father_id)
            .map_err(|err| LoadError::corrupt(self.path, err.to_string()))?;
        stack.extend(rows.into_iter().rev().map(|(node_id, sequence, master_id)| ChildRow {
            node_id,
            father_id,
            sequence,
            master_id,
            parent,
        }));
        Ok(())
    }

    fn children_rows(&self, father_id: i64) -> rusqlite::Result<Vec<(i64, i64, i64)>> {
        let sql = if self.support.children_master {
            "SELECT node_id, sequence, master_id FROM children WHERE father_id = ?1 \
             ORDER BY sequence, node_id"
        } else {
            "SELECT node_id, sequence, 0 FROM children WHERE father_id = ?1 \
             ORDER BY sequence, node_id"
        };
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map([father_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                row.get::<_, Option<i64>>(2)?.unwrap_or(0),
            ))
        })?;
        rows.collect()
    }

    /// Reads the scalar row of `node_id`; members without their own row
    /// borrow the master's.
    fn node_record(&self, node_id: i64, master_id: i64) -> Result<NodeRecord, LoadError> {
        let own = read_node_row(self.conn, node_id, self.support)
            .map_err(|err| LoadError::corrupt(self.path, err.to_string()))?;
        let row = match own {
            Some(row) => row,
            None if master_id > 0 => read_node_row(self.conn, master_id, self.support)
                .map_err(|err| LoadError::corrupt(self.path, err.to_string()))?
                .ok_or_else(|| {
                    LoadError::corrupt(
                        self.path,
                        format!("shared node {node_id} references missing master {master_id}"),
                    )
                })?,
            None => {
                return Err(LoadError::corrupt(
                    self.path,
                    format!("hierarchy references missing node {node_id}"),
                ))
            }
        };
        Ok(row.into_record(node_id as NodeId))
    }
}

/// Scalar columns of one `node` row.
struct NodeRow {
    name: String,
    syntax: String,
    tags: String,
    is_ro: i64,
    is_richtxt: i64,
    level: i64,
    ts_creation: i64,
    ts_lastsave: i64,
}

impl NodeRow {
    fn into_record(self, id: NodeId) -> NodeRecord {
        let mut record = NodeRecord::with_id(id, self.name, ContentKind::from_syntax(&self.syntax));
        let (is_read_only, custom_icon_id) = unpack_read_only_icon(self.is_ro);
        let style = unpack_style(self.is_richtxt);
        let (exclude_self, exclude_children) = unpack_search_exclusion(self.level);
        record.tags = self.tags;
        record.is_read_only = is_read_only;
        record.custom_icon_id = custom_icon_id;
        record.is_bold = style.is_bold;
        record.foreground = style.foreground;
        record.exclude_from_search = exclude_self;
        record.exclude_children_from_search = exclude_children;
        record.created_at = self.ts_creation;
        record.modified_at = self.ts_lastsave;
        record
    }
}

fn text_col(row: &Row<'_>, index: usize) -> rusqlite::Result<String> {
    Ok(row.get::<_, Option<String>>(index)?.unwrap_or_default())
}

fn int_col(row: &Row<'_>, index: usize) -> rusqlite::Result<i64> {
    Ok(row.get::<_, Option<i64>>(index)?.unwrap_or(0))
}

fn read_node_row(
    conn: &Connection,
    node_id: i64,
    support: ColumnSupport,
) -> rusqlite::Result<Option<NodeRow>> {
    let sql = if support.node_timestamps {
        "SELECT name, syntax, tags, is_ro, is_richtxt, level, ts_creation, ts_lastsave \
         FROM node WHERE node_id = ?1"
    } else {
        "SELECT name, syntax, tags, is_ro, is_richtxt, level, 0, 0 FROM node WHERE node_id = ?1"
    };
    let mut stmt = conn.prepare_cached(sql)?;
    stmt.query_row([node_id], |row| {
        Ok(NodeRow {
            name: text_col(row, 0)?,
            syntax: text_col(row, 1)?,
            tags: text_col(row, 2)?,
            is_ro: int_col(row, 3)?,
            is_richtxt: int_col(row, 4)?,
            level: int_col(row, 5)?,
            ts_creation: int_col(row, 6)?,
            ts_lastsave: int_col(row, 7)?,
        })
    })
    .optional()
}

fn read_bookmarks(conn: &Connection) -> rusqlite::Result<Vec<NodeId>> {
    let mut stmt = conn.prepare("SELECT node_id FROM bookmark ORDER BY sequence, node_id")?;
    let ids = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut out = Vec::new();
    for id in ids {
        if let Ok(id) = NodeId::try_from(id?) {
            out.push(id);
        }
    }
    Ok(out)
}

/// Reads body text and anchored objects of `id`; `None` without a node row.
fn read_body(
    conn: &Connection,
    id: NodeId,
    support: ColumnSupport,
) -> rusqlite::Result<Option<Body>> {
    let node_id = id as i64;
    let head = conn
        .prepare_cached(
            "SELECT txt, has_codebox, has_table, has_image FROM node WHERE node_id = ?1",
        )?
        .query_row([node_id], |row| {
            Ok((
                text_col(row, 0)?,
                int_col(row, 1)? != 0,
                int_col(row, 2)? != 0,
                int_col(row, 3)? != 0,
            ))
        })
        .optional()?;
    let Some((text, has_codebox, has_table, has_image)) = head else {
        return Ok(None);
    };

    let mut body = Body::text(text);
    if has_image && support.image_table {
        read_image_rows(conn, node_id, support, &mut body.objects)?;
    }
    if has_codebox && support.codebox_table {
        read_codebox_rows(conn, node_id, &mut body.objects)?;
    }
    if has_table && support.grid_table {
        read_grid_rows(conn, node_id, &mut body.objects)?;
    }
    body.sort_objects();
    Ok(Some(body))
}

fn read_image_rows(
    conn: &Connection,
    node_id: i64,
    support: ColumnSupport,
    out: &mut Vec<AnchoredObject>,
) -> rusqlite::Result<()> {
    let sql = if support.image_extras {
        "SELECT offset, justification, anchor, png, filename, link, time FROM image \
         WHERE node_id = ?1 ORDER BY offset"
    } else {
        "SELECT offset, justification, anchor, png, '', '', 0 FROM image \
         WHERE node_id = ?1 ORDER BY offset"
    };
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map([node_id], |row| {
        let anchor = text_col(row, 2)?;
        let data = row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default();
        let filename = text_col(row, 4)?;
        let payload = if !anchor.is_empty() {
            AnchoredPayload::Anchor { name: anchor }
        } else if !filename.is_empty() {
            AnchoredPayload::File {
                filename,
                data,
                time: int_col(row, 6)?,
            }
        } else {
            AnchoredPayload::Image {
                png: data,
                link: text_col(row, 5)?,
            }
        };
        Ok(AnchoredObject {
            offset: int_col(row, 0)?,
            justification: Justification::from_token(&text_col(row, 1)?),
            payload,
        })
    })?;
    for row in rows {
        out.push(row?);
    }
    Ok(())
}

fn read_codebox_rows(
    conn: &Connection,
    node_id: i64,
    out: &mut Vec<AnchoredObject>,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "SELECT offset, justification, txt, syntax, width, height, is_width_pix, \
         do_highl_bra, do_show_linenum FROM codebox WHERE node_id = ?1 ORDER BY offset",
    )?;
    let rows = stmt.query_map([node_id], |row| {
        Ok(AnchoredObject {
            offset: int_col(row, 0)?,
            justification: Justification::from_token(&text_col(row, 1)?),
            payload: AnchoredPayload::CodeBox {
                text: text_col(row, 2)?,
                syntax: text_col(row, 3)?,
                width: int_col(row, 4)?,
                height: int_col(row, 5)?,
                width_in_pixels: int_col(row, 6)? != 0,
                highlight_brackets: int_col(row, 7)? != 0,
                show_line_numbers: int_col(row, 8)? != 0,
            },
        })
    })?;
    for row in rows {
        out.push(row?);
    }
    Ok(())
}

fn read_grid_rows(
    conn: &Connection,
    node_id: i64,
    out: &mut Vec<AnchoredObject>,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "SELECT offset, justification, txt, col_min, col_max FROM grid \
         WHERE node_id = ?1 ORDER BY offset",
    )?;
    let rows = stmt.query_map([node_id], |row| {
        Ok(AnchoredObject {
            offset: int_col(row, 0)?,
            justification: Justification::from_token(&text_col(row, 1)?),
            payload: AnchoredPayload::Table {
                content: text_col(row, 2)?,
                col_min: int_col(row, 3)?,
                col_max: int_col(row, 4)?,
            },
        })
    })?;
    for row in rows {
        out.push(row?);
    }
    Ok(())
}

/// Body to persist for owner `id`: the resident one, else the stored one.
fn body_for_write(
    tree: &NoteTree,
    id: NodeId,
    stored: Option<&Connection>,
    support: ColumnSupport,
) -> Result<Body, SaveError> {
    if let Some(body) = tree.get(id).and_then(|record| record.body.as_ref()) {
        return Ok(body.clone());
    }
    if let Some(conn) = stored {
        if let Some(body) = read_body(conn, id, support)? {
            return Ok(body);
        }
    }
    Err(SaveError::Backend(format!("body of node {id} is not loaded")))
}

fn write_everything(
    conn: &mut Connection,
    tree: &NoteTree,
    previous: Option<&Connection>,
    previous_support: ColumnSupport,
) -> Result<usize, SaveError> {
    let tx = conn.transaction()?;
    let mut written = 0usize;
    for id in tree.preorder() {
        written += insert_children_row(&tx, tree, id)?;
        let record = tree
            .get(id)
            .ok_or_else(|| SaveError::Backend(format!("node {id} vanished during save")))?;
        if record.is_shared_member() {
            written += insert_node_row(&tx, record, None)?;
        } else {
            let body = body_for_write(tree, id, previous, previous_support)?;
            written += insert_node_row(&tx, record, Some(&body))?;
            written += insert_object_rows(&tx, id, &body)?;
        }
    }
    written += write_bookmarks(&tx, tree)?;
    tx.commit()?;
    Ok(written)
}

fn apply_node_state(
    conn: &Connection,
    tree: &NoteTree,
    id: NodeId,
    state: NodeSyncState,
    children_rewritten: bool,
    support: ColumnSupport,
) -> Result<usize, SaveError> {
    let record = tree
        .get(id)
        .ok_or_else(|| SaveError::Backend(format!("node {id} vanished during save")))?;
    let node_id = id as i64;
    let mut written = 0usize;

    if state.is_new {
        let body = if record.is_shared_member() {
            None
        } else {
            Some(body_for_write(tree, id, Some(conn), support)?)
        };
        // Also drops a children row written by the table rewrite above.
        written += delete_node_rows(conn, id)?;
        written += insert_children_row(conn, tree, id)?;
        written += insert_node_row(conn, record, body.as_ref())?;
        if let Some(body) = body.as_ref() {
            written += insert_object_rows(conn, id, body)?;
        }
        return Ok(written);
    }

    if state.hierarchy_dirty && !children_rewritten {
        written += conn.execute("DELETE FROM children WHERE node_id = ?1", [node_id])?;
        written += insert_children_row(conn, tree, id)?;
    }

    if state.prop_dirty {
        let changed = conn.execute(
            "UPDATE node SET name = ?2, syntax = ?3, tags = ?4, is_ro = ?5, is_richtxt = ?6, \
             level = ?7, ts_creation = ?8, ts_lastsave = ?9 WHERE node_id = ?1",
            params![
                node_id,
                record.name,
                record.content_kind.syntax(),
                record.tags,
                pack_read_only_icon(record.is_read_only, record.custom_icon_id),
                style_column(record),
                pack_search_exclusion(
                    record.exclude_from_search,
                    record.exclude_children_from_search
                ),
                record.created_at,
                record.modified_at,
            ],
        )?;
        if changed == 0 {
            let body = if record.is_shared_member() {
                None
            } else {
                Some(body_for_write(tree, id, Some(conn), support)?)
            };
            written += insert_node_row(conn, record, body.as_ref())?;
            if let Some(body) = body.as_ref() {
                written += delete_object_rows(conn, id)?;
                written += insert_object_rows(conn, id, body)?;
            }
            return Ok(written);
        }
        written += changed;
    }

    if state.body_dirty && !record.is_shared_member() {
        let body = body_for_write(tree, id, Some(conn), support)?;
        let changed = conn.execute(
            "UPDATE node SET txt = ?2, syntax = ?3, is_richtxt = ?4, has_codebox = ?5, \
             has_table = ?6, has_image = ?7, ts_lastsave = ?8 WHERE node_id = ?1",
            params![
                node_id,
                body.text,
                record.content_kind.syntax(),
                style_column(record),
                body.has_kind(AnchoredKind::CodeBox),
                body.has_kind(AnchoredKind::Table),
                has_image_rows(&body),
                record.modified_at,
            ],
        )?;
        if changed == 0 {
            written += insert_node_row(conn, record, Some(&body))?;
        } else {
            written += changed;
        }
        written += delete_object_rows(conn, id)?;
        written += insert_object_rows(conn, id, &body)?;
    }
    Ok(written)
}

fn style_column(record: &NodeRecord) -> i64 {
    pack_style(StyleFlags {
        is_rich_text: record.content_kind.is_rich_text(),
        is_bold: record.is_bold,
        foreground: record.foreground,
    })
}

fn has_image_rows(body: &Body) -> bool {
    body.has_kind(AnchoredKind::Image)
        || body.has_kind(AnchoredKind::File)
        || body.has_kind(AnchoredKind::Anchor)
}

fn insert_children_row(conn: &Connection, tree: &NoteTree, id: NodeId) -> Result<usize, SaveError> {
    let node = tree
        .node(id)
        .ok_or_else(|| SaveError::Backend(format!("node {id} vanished during save")))?;
    let father_id = node.parent().map_or(0, |parent| parent as i64);
    let written = conn.execute(
        "INSERT INTO children (node_id, father_id, sequence, master_id) VALUES (?1, ?2, ?3, ?4)",
        params![
            id as i64,
            father_id,
            node.sequence(),
            node.record().shared_master_id as i64
        ],
    )?;
    Ok(written)
}

fn insert_node_row(
    conn: &Connection,
    record: &NodeRecord,
    body: Option<&Body>,
) -> Result<usize, SaveError> {
    let (text, has_codebox, has_table, has_image) = match body {
        Some(body) => (
            body.text.as_str(),
            body.has_kind(AnchoredKind::CodeBox),
            body.has_kind(AnchoredKind::Table),
            has_image_rows(body),
        ),
        None => ("", false, false, false),
    };
    let written = conn.execute(
        "INSERT INTO node (node_id, name, txt, syntax, tags, is_ro, is_richtxt, has_codebox, \
         has_table, has_image, level, ts_creation, ts_lastsave) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            record.id as i64,
            record.name,
            text,
            record.content_kind.syntax(),
            record.tags,
            pack_read_only_icon(record.is_read_only, record.custom_icon_id),
            style_column(record),
            has_codebox,
            has_table,
            has_image,
            pack_search_exclusion(
                record.exclude_from_search,
                record.exclude_children_from_search
            ),
            record.created_at,
            record.modified_at,
        ],
    )?;
    Ok(written)
}

fn insert_object_rows(conn: &Connection, id: NodeId, body: &Body) -> Result<usize, SaveError> {
    let node_id = id as i64;
    let mut written = 0usize;
    for object in &body.objects {
        let justification = object.justification.as_token();
        written += match &object.payload {
            AnchoredPayload::Image { png, link } => conn.execute(
                "INSERT INTO image (node_id, offset, justification, anchor, png, filename, link, time) \
                 VALUES (?1, ?2, ?3, '', ?4, '', ?5, 0)",
                params![node_id, object.offset, justification, png, link],
            )?,
            AnchoredPayload::File {
                filename,
                data,
                time,
            } => conn.execute(
                "INSERT INTO image (node_id, offset, justification, anchor, png, filename, link, time) \
                 VALUES (?1, ?2, ?3, '', ?4, ?5, '', ?6)",
                params![node_id, object.offset, justification, data, filename, time],
            )?,
            AnchoredPayload::Anchor { name } => conn.execute(
                "INSERT INTO image (node_id, offset, justification, anchor, png, filename, link, time) \
                 VALUES (?1, ?2, ?3, ?4, NULL, '', '', 0)",
                params![node_id, object.offset, justification, name],
            )?,
            AnchoredPayload::CodeBox {
                text,
                syntax,
                width,
                height,
                width_in_pixels,
                highlight_brackets,
                show_line_numbers,
            } => conn.execute(
                "INSERT INTO codebox (node_id, offset, justification, txt, syntax, width, height, \
                 is_width_pix, do_highl_bra, do_show_linenum) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    node_id,
                    object.offset,
                    justification,
                    text,
                    syntax,
                    width,
                    height,
                    width_in_pixels,
                    highlight_brackets,
                    show_line_numbers
                ],
            )?,
            AnchoredPayload::Table {
                content,
                col_min,
                col_max,
            } => conn.execute(
                "INSERT INTO grid (node_id, offset, justification, txt, col_min, col_max) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![node_id, object.offset, justification, content, col_min, col_max],
            )?,
        };
    }
    Ok(written)
}

fn delete_object_rows(conn: &Connection, id: NodeId) -> Result<usize, SaveError> {
    let mut written = 0usize;
    for table in AUX_TABLES {
        written += conn.execute(&format!("DELETE FROM {table} WHERE node_id = ?1"), [id as i64])?;
    }
    Ok(written)
}

fn delete_node_rows(conn: &Connection, id: NodeId) -> Result<usize, SaveError> {
    let node_id = id as i64;
    let mut written = delete_object_rows(conn, id)?;
    written += conn.execute("DELETE FROM node WHERE node_id = ?1", [node_id])?;
    written += conn.execute("DELETE FROM children WHERE node_id = ?1", [node_id])?;
    Ok(written)
}

fn write_bookmarks(conn: &Connection, tree: &NoteTree) -> Result<usize, SaveError> {
    let mut written = conn.execute("DELETE FROM bookmark", [])?;
    for (index, id) in tree.bookmarks().as_slice().iter().enumerate() {
        written += conn.execute(
            "INSERT INTO bookmark (node_id, sequence) VALUES (?1, ?2)",
            params![*id as i64, index as i64 + 1],
        )?;
    }
    Ok(written)
}
