//! Table inspection and repair for files written by older versions.
//!
//! # Responsibility
//! - Detect tables and columns missing from an existing file.
//! - Add missing columns with neutral defaults.
//! - Run the quick integrity check.

use super::{DbError, DbResult};
use rusqlite::Connection;

/// Tables a readable document must contain.
pub const REQUIRED_TABLES: &[&str] = &["node", "children"];

/// Tables that may be absent in old or minimal files.
pub const OPTIONAL_TABLES: &[&str] = &["bookmark", "codebox", "grid", "image"];

/// Columns added after the first file format, with their definitions.
pub const OPTIONAL_COLUMNS: &[(&str, &str, &str)] = &[
    ("node", "ts_creation", "INTEGER DEFAULT 0"),
    ("node", "ts_lastsave", "INTEGER DEFAULT 0"),
    ("image", "filename", "TEXT DEFAULT ''"),
    ("image", "link", "TEXT DEFAULT ''"),
    ("image", "time", "INTEGER DEFAULT 0"),
    ("children", "master_id", "INTEGER DEFAULT 0"),
];

const MAX_REPORTED_PROBLEMS: usize = 5;

pub fn table_exists(conn: &Connection, table: &str) -> DbResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1;",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> DbResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Optional columns missing from tables that exist.
pub fn missing_columns(conn: &Connection) -> DbResult<Vec<(&'static str, &'static str)>> {
    let mut missing = Vec::new();
    for (table, column, _) in OPTIONAL_COLUMNS {
        if table_exists(conn, table)? && !column_exists(conn, table, column)? {
            missing.push((*table, *column));
        }
    }
    Ok(missing)
}

/// Whether anything `repair_tables` would fix is missing.
pub fn needs_repair(conn: &Connection) -> DbResult<bool> {
    for table in OPTIONAL_TABLES {
        if !table_exists(conn, table)? {
            return Ok(true);
        }
    }
    Ok(!missing_columns(conn)?.is_empty())
}

/// Adds every missing optional column; returns the repaired `table.column`
/// names. Missing tables are created by the migrations, not here.
pub fn repair_tables(conn: &Connection) -> DbResult<Vec<String>> {
    let mut repaired = Vec::new();
    for (table, column) in missing_columns(conn)? {
        let definition = OPTIONAL_COLUMNS
            .iter()
            .find(|(t, c, _)| *t == table && *c == column)
            .map(|(_, _, definition)| *definition)
            .unwrap_or("INTEGER DEFAULT 0");
        conn.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN {column} {definition};"
        ))?;
        repaired.push(format!("{table}.{column}"));
    }
    Ok(repaired)
}

/// Runs `PRAGMA quick_check`, failing with the first reported problems.
pub fn quick_check(conn: &Connection) -> DbResult<()> {
    let mut stmt = conn.prepare("PRAGMA quick_check;")?;
    let mut rows = stmt.query([])?;
    let mut problems = Vec::new();
    while let Some(row) = rows.next()? {
        let line: String = row.get(0)?;
        if line != "ok" {
            problems.push(line);
        }
        if problems.len() >= MAX_REPORTED_PROBLEMS {
            break;
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(DbError::IntegrityCheckFailed(problems))
    }
}
