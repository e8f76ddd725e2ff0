//! Connection bootstrap for document database files.
//!
//! # Invariants
//! - Returned connections carry the configured busy timeout.
//! - `open_db` never changes the file; `create_db` leaves the schema at the
//!   latest migration.

use super::migrations::{apply_migrations, ensure_supported_version};
use super::DbResult;
use log::{error, info};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::{Duration, Instant};

/// Opens an existing document database without touching its schema.
///
/// # Errors
/// - `Sqlite` when the file is missing or not a database.
/// - `UnsupportedSchemaVersion` when the file is newer than this binary.
pub fn open_db(path: impl AsRef<Path>, busy_timeout: Duration) -> DbResult<Connection> {
    open_logged("existing", busy_timeout, || {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        ensure_supported_version(&conn)?;
        Ok(conn)
    })
}

/// Opens or creates a document database and applies pending migrations.
pub fn create_db(path: impl AsRef<Path>, busy_timeout: Duration) -> DbResult<Connection> {
    open_logged("create", busy_timeout, || {
        let mut conn = Connection::open(path.as_ref())?;
        apply_migrations(&mut conn)?;
        Ok(conn)
    })
}

fn open_logged(
    mode: &str,
    busy_timeout: Duration,
    open: impl FnOnce() -> DbResult<Connection>,
) -> DbResult<Connection> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode={mode}");

    let result = open().and_then(|conn| {
        conn.busy_timeout(busy_timeout)?;
        Ok(conn)
    });
    match &result {
        Ok(_) => info!(
            "event=db_open module=db status=ok mode={mode} duration_ms={}",
            started_at.elapsed().as_millis()
        ),
        Err(err) => error!(
            "event=db_open module=db status=error mode={mode} duration_ms={} error={}",
            started_at.elapsed().as_millis(),
            err
        ),
    }
    result
}
