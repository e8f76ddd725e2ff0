//! Storage backend contract and format selection.
//!
//! # Responsibility
//! - Define the load/save contract shared by the XML and SQLite backends.
//! - Map file extensions to physical formats.
//! - Graft whole documents into an open tree.
//!
//! # Invariants
//! - Loaders report nodes parent-before-child through a `NodeSink`.
//! - A failed populate leaves nothing the caller should keep.
//! - A failed save leaves the previous file content intact.

use crate::config::StorageConfig;
use crate::model::node::{Body, NodeId, NodeRecord};
use crate::tree::load::ImportSink;
use crate::tree::sync::SyncPending;
use crate::tree::{NoteTree, TreeError};
use log::{error, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub mod sqlite;
pub mod xml;

pub use sqlite::SqliteBackend;
pub use xml::XmlBackend;

/// Physical encoding of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocType {
    /// Nested element tree rewritten on every save.
    Xml,
    /// Relational database patched incrementally.
    Sqlite,
}

/// Encoding plus whether an external wrapper encloses the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocFormat {
    pub doc_type: DocType,
    pub is_wrapped: bool,
}

/// Selects the format from the file extension (case-insensitive).
pub fn format_for_path(path: &Path) -> Option<DocFormat> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let (doc_type, is_wrapped) = match extension.as_str() {
        "ctd" => (DocType::Xml, false),
        "ctz" => (DocType::Xml, true),
        "ctb" => (DocType::Sqlite, false),
        "ctx" => (DocType::Sqlite, true),
        _ => return None,
    };
    Some(DocFormat {
        doc_type,
        is_wrapped,
    })
}

/// Load failures.
#[derive(Debug)]
pub enum LoadError {
    /// File missing or unreadable.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Structural violation or unparsable required field.
    Corrupt { path: PathBuf, message: String },
}

impl LoadError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn corrupt(path: &Path, message: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

impl Display for LoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot read document {}: {source}", path.display())
            }
            Self::Corrupt { path, message } => {
                write!(f, "corrupt document {}: {message}", path.display())
            }
        }
    }
}

impl Error for LoadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Corrupt { .. } => None,
        }
    }
}

/// Save failures.
#[derive(Debug)]
pub enum SaveError {
    /// File-system failure while writing or renaming.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Statement, transaction or serializer failure.
    Backend(String),
}

impl SaveError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl Display for SaveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot write document {}: {source}", path.display())
            }
            Self::Backend(message) => write!(f, "storage backend failure: {message}"),
        }
    }
}

impl Error for SaveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Backend(_) => None,
        }
    }
}

impl From<rusqlite::Error> for SaveError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Subtree import failures.
#[derive(Debug)]
pub enum ImportError {
    Load(LoadError),
    Tree(TreeError),
}

impl Display for ImportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(err) => write!(f, "{err}"),
            Self::Tree(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ImportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Load(err) => Some(err),
            Self::Tree(err) => Some(err),
        }
    }
}

impl From<LoadError> for ImportError {
    fn from(value: LoadError) -> Self {
        Self::Load(value)
    }
}

impl From<TreeError> for ImportError {
    fn from(value: TreeError) -> Self {
        Self::Tree(value)
    }
}

/// Receiver of nodes enumerated by a backend during populate.
pub trait NodeSink {
    /// Accepts one record; `parent` is an id previously returned by this
    /// sink. `sequence` carries the stored sibling order when the format
    /// has one. Returns the id under which the node was attached.
    fn node_loaded(
        &mut self,
        record: NodeRecord,
        parent: Option<NodeId>,
        sequence: Option<i64>,
    ) -> Result<NodeId, LoadError>;

    /// Accepts the stored bookmark ids in display order.
    fn bookmarks_loaded(&mut self, ids: Vec<NodeId>);

    /// Signals that the file needs structural repair on the next save.
    fn request_table_fix(&mut self) {}
}

/// Physical codec for one document.
///
/// Methods run synchronously on the document thread.
pub trait StorageBackend {
    fn config(&self) -> &StorageConfig;

    /// Reads `path` and reports every node to `sink`.
    fn populate(&mut self, path: &Path, sink: &mut dyn NodeSink) -> Result<(), LoadError>;

    /// Persists `tree` into `path`.
    ///
    /// `full_rewrite` asks for a complete new file; otherwise backends that
    /// support it only touch what `pending` names.
    fn save(
        &mut self,
        path: &Path,
        tree: &NoteTree,
        pending: &SyncPending,
        full_rewrite: bool,
    ) -> Result<(), SaveError>;

    /// Compacts the file without losing data.
    fn vacuum(&mut self, path: &Path) -> Result<(), SaveError>;

    /// Loads the body owned by `id`; `None` when bodies are always resident.
    fn fetch_body(&self, id: NodeId) -> Result<Option<Body>, LoadError>;

    /// Grafts the top-level nodes of `source` under `target_parent`.
    fn import_subtree(
        &self,
        source: &Path,
        tree: &mut NoteTree,
        target_parent: Option<NodeId>,
    ) -> Result<Vec<NodeId>, ImportError> {
        import_subtree(source, tree, target_parent, self.config())
    }

    /// Releases the open handle, if any.
    fn close(&mut self);
}

/// Builds a backend for `doc_type`.
pub fn backend_for(doc_type: DocType, config: StorageConfig) -> Box<dyn StorageBackend> {
    match doc_type {
        DocType::Xml => Box::new(XmlBackend::new(config)),
        DocType::Sqlite => Box::new(SqliteBackend::new(config)),
    }
}

/// Reads a whole document of either kind and grafts its top-level nodes
/// under `target_parent` with fresh ids.
///
/// Shared references inside the imported set are remapped; bodies are
/// fetched eagerly so the source file can be closed. On failure every
/// grafted node is removed again.
pub fn import_subtree(
    source: &Path,
    tree: &mut NoteTree,
    target_parent: Option<NodeId>,
    config: &StorageConfig,
) -> Result<Vec<NodeId>, ImportError> {
    let started_at = Instant::now();
    if let Some(parent) = target_parent {
        if !tree.contains(parent) {
            return Err(TreeError::NodeNotFound(parent).into());
        }
    }
    let format = format_for_path(source)
        .ok_or_else(|| LoadError::corrupt(source, "unsupported document extension"))?;

    let mut backend = backend_for(format.doc_type, config.clone());
    let mut sink = ImportSink::new(tree, target_parent, source);
    let outcome = backend
        .populate(source, &mut sink)
        .and_then(|()| sink.fetch_bodies(backend.as_ref()));
    backend.close();

    match outcome {
        Ok(()) => {
            let roots = sink.finish();
            info!(
                "event=subtree_import module=storage status=ok roots={} duration_ms={}",
                roots.len(),
                started_at.elapsed().as_millis()
            );
            Ok(roots)
        }
        Err(err) => {
            sink.rollback();
            error!(
                "event=subtree_import module=storage status=error duration_ms={} error={}",
                started_at.elapsed().as_millis(),
                err
            );
            Err(err.into())
        }
    }
}

/// `<path>.tmp` next to `path`, used for write-then-rename saves.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Parses an integer attribute: hexadecimal with a `0x` prefix, decimal
/// otherwise.
pub(crate) fn parse_int(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let parsed = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -parsed } else { parsed })
}

/// Parses a boolean token by its first character (`T`, `t` or `1`).
pub(crate) fn parse_bool(value: &str) -> bool {
    matches!(value.trim().chars().next(), Some('T' | 't' | '1'))
}

#[cfg(test)]
mod tests {
    use super::{format_for_path, parse_bool, parse_int, DocType};
    use std::path::Path;

    #[test]
    fn extensions_select_format() {
        let xml = format_for_path(Path::new("notes.ctd")).unwrap();
        assert_eq!(xml.doc_type, DocType::Xml);
        assert!(!xml.is_wrapped);

        let wrapped = format_for_path(Path::new("/tmp/Notes.CTX")).unwrap();
        assert_eq!(wrapped.doc_type, DocType::Sqlite);
        assert!(wrapped.is_wrapped);

        assert!(format_for_path(Path::new("notes.txt")).is_none());
        assert!(format_for_path(Path::new("notes")).is_none());
    }

    #[test]
    fn integers_honour_hex_prefix() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("0x2a"), Some(42));
        assert_eq!(parse_int("0X2A"), Some(42));
        assert_eq!(parse_int("-7"), Some(-7));
        assert_eq!(parse_int("2a"), None);
        assert_eq!(parse_int(""), None);
    }

    #[test]
    fn booleans_use_first_letter() {
        assert!(parse_bool("True"));
        assert!(parse_bool("t"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("False"));
        assert!(!parse_bool(""));
    }
}
