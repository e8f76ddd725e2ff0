//! SQLite plumbing for the relational document format.
//!
//! # Responsibility
//! - Open and configure connections to document database files.
//! - Create the document schema through versioned migrations.
//! - Inspect and repair tables written by older versions.
//!
//! # Invariants
//! - Migration version is mirrored in `PRAGMA user_version`.
//! - Files declaring a newer schema than this binary are never written.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;
pub mod schema;

pub use open::{create_db, open_db};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    /// `PRAGMA quick_check` reported problems.
    IntegrityCheckFailed(Vec<String>),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::IntegrityCheckFailed(problems) => {
                write!(f, "integrity check failed: {}", problems.join("; "))
            }
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::UnsupportedSchemaVersion { .. } | Self::IntegrityCheckFailed(_) => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
