//! Rotating `~` backups around document saves.
//!
//! # Responsibility
//! - Stage a copy of the current file as `<file>!` before a save.
//! - Promote the staged copy to `<file>~` after a successful save, shifting
//!   older generations to `~~`, `~~~` up to the configured count.
//! - Place generations under a custom directory when one is configured.
//!
//! # Invariants
//! - The staged copy always lives next to the document.
//! - Generation `n` is the document file name followed by `n` tildes.

use crate::config::StorageConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

static UNSAFE_PATH_CHARS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\\/:*?"<>|]+"#).expect("valid path sanitizer regex"));

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// `<file>!`, the copy taken before a save.
pub fn staged_path(path: &Path) -> PathBuf {
    with_suffix(path, "!")
}

/// Directory that holds the tilde generations of `path`.
pub fn backup_dir_for(path: &Path, config: &StorageConfig) -> PathBuf {
    match config.custom_backup_dir.as_ref() {
        Some(dir) => {
            let full = path
                .canonicalize()
                .unwrap_or_else(|_| path.to_path_buf());
            let lossy = full.to_string_lossy();
            let sanitized = UNSAFE_PATH_CHARS_RE.replace_all(&lossy, "_");
            dir.join(sanitized.trim_matches('_'))
        }
        None => path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    }
}

/// Path of backup generation `generation` (1-based).
pub fn backup_path(path: &Path, config: &StorageConfig, generation: u32) -> PathBuf {
    let file_name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    let base = backup_dir_for(path, config).join(file_name);
    with_suffix(&base, &"~".repeat(generation as usize))
}

/// Copies the current file to `<file>!`; `None` when there is nothing to
/// back up or backups are disabled.
pub fn stage(path: &Path, config: &StorageConfig) -> io::Result<Option<PathBuf>> {
    if !config.backup_copy || !path.is_file() {
        return Ok(None);
    }
    let staged = staged_path(path);
    fs::copy(path, &staged)?;
    Ok(Some(staged))
}

/// Turns the staged copy into generation 1 after shifting older ones.
pub fn rotate(staged: &Path, path: &Path, config: &StorageConfig) -> io::Result<()> {
    if config.backup_num == 0 {
        return discard(staged);
    }
    let dir = backup_dir_for(path, config);
    if !dir.as_os_str().is_empty() {
        fs::create_dir_all(&dir)?;
    }
    for generation in (1..config.backup_num).rev() {
        let older = backup_path(path, config, generation);
        if older.exists() {
            fs::rename(&older, backup_path(path, config, generation + 1))?;
        }
    }
    move_file(staged, &backup_path(path, config, 1))
}

/// Removes the staged copy, ignoring a missing file.
pub fn discard(staged: &Path) -> io::Result<()> {
    match fs::remove_file(staged) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}
