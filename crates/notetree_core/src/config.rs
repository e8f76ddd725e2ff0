//! Storage configuration passed to backends and the document store.
//!
//! # Invariants
//! - Every field has a default so partial JSON/TOML documents deserialize.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for persistence and backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Keep rotating `~` backups of the previous file on save.
    pub backup_copy: bool,
    /// Number of rotating backups (`~`, `~~`, ...).
    pub backup_num: u32,
    /// Directory for backups instead of next to the document.
    pub custom_backup_dir: Option<PathBuf>,
    /// SQLite busy timeout.
    pub sqlite_busy_timeout_ms: u64,
    /// Spaces per nesting level in XML output.
    pub xml_indent: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_copy: true,
            backup_num: 3,
            custom_backup_dir: None,
            sqlite_busy_timeout_ms: 5_000,
            xml_indent: 1,
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.sqlite_busy_timeout_ms)
    }

    /// Configuration with backups switched off.
    pub fn without_backups() -> Self {
        Self {
            backup_copy: false,
            ..Self::default()
        }
    }
}
