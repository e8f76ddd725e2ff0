//! Document store: one tree bound to one storage backend.
//!
//! # Responsibility
//! - Choose the backend from the file extension and populate the tree.
//! - Drive save, save-as and vacuum with rotating backups.
//! - Serve bodies lazily, redirected to the shared master.
//!
//! # Invariants
//! - A failed save restores the drained dirty state and removes the staged
//!   backup; the previous file stays intact.
//! - The first save after `create` or `save_as` rewrites the whole file.
//! - Wrapped formats are only opened through an unwrapped payload path.

use super::backup;
use crate::config::StorageConfig;
use crate::model::node::{Body, NodeId};
use crate::storage::{
    backend_for, format_for_path, DocFormat, ImportError, LoadError, SaveError, StorageBackend,
};
use crate::tree::load::PopulateSink;
use crate::tree::{NoteTree, TreeError};
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Document store failures.
#[derive(Debug)]
pub enum DocumentError {
    /// Extension maps to no known format.
    UnsupportedFormat(PathBuf),
    /// Wrapped formats need the unwrapped payload path.
    WrappedPayloadRequired(PathBuf),
    Load(LoadError),
    Save(SaveError),
    Tree(TreeError),
    Import(ImportError),
}

impl Display for DocumentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedFormat(path) => {
                write!(f, "unsupported document format: {}", path.display())
            }
            Self::WrappedPayloadRequired(path) => write!(
                f,
                "wrapped document {} must be opened through its payload",
                path.display()
            ),
            Self::Load(err) => write!(f, "{err}"),
            Self::Save(err) => write!(f, "{err}"),
            Self::Tree(err) => write!(f, "{err}"),
            Self::Import(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DocumentError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Load(err) => Some(err),
            Self::Save(err) => Some(err),
            Self::Tree(err) => Some(err),
            Self::Import(err) => Some(err),
            Self::UnsupportedFormat(_) | Self::WrappedPayloadRequired(_) => None,
        }
    }
}

impl From<LoadError> for DocumentError {
    fn from(value: LoadError) -> Self {
        Self::Load(value)
    }
}

impl From<SaveError> for DocumentError {
    fn from(value: SaveError) -> Self {
        Self::Save(value)
    }
}

impl From<TreeError> for DocumentError {
    fn from(value: TreeError) -> Self {
        Self::Tree(value)
    }
}

impl From<ImportError> for DocumentError {
    fn from(value: ImportError) -> Self {
        Self::Import(value)
    }
}

/// An open note document.
pub struct Document {
    path: PathBuf,
    payload_path: PathBuf,
    format: DocFormat,
    config: StorageConfig,
    backend: Box<dyn StorageBackend>,
    tree: NoteTree,
    needs_full_write: bool,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("path", &self.path)
            .field("payload_path", &self.payload_path)
            .field("format", &self.format)
            .field("nodes", &self.tree.len())
            .field("needs_full_write", &self.needs_full_write)
            .finish()
    }
}

fn plain_format(path: &Path) -> DocumentResult<DocFormat> {
    let format =
        format_for_path(path).ok_or_else(|| DocumentError::UnsupportedFormat(path.to_path_buf()))?;
    if format.is_wrapped {
        return Err(DocumentError::WrappedPayloadRequired(path.to_path_buf()));
    }
    Ok(format)
}

impl Document {
    /// Starts an empty document; nothing is written until the first save.
    pub fn create(path: impl AsRef<Path>, config: StorageConfig) -> DocumentResult<Self> {
        let path = path.as_ref();
        let format = plain_format(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            payload_path: path.to_path_buf(),
            format,
            backend: backend_for(format.doc_type, config.clone()),
            config,
            tree: NoteTree::new(),
            needs_full_write: true,
        })
    }

    /// Opens a plain (unwrapped) document.
    pub fn open(path: impl AsRef<Path>, config: StorageConfig) -> DocumentResult<Self> {
        let path = path.as_ref();
        plain_format(path)?;
        Self::load(path, path, config)
    }

    /// Opens a document whose payload was unwrapped to `payload_path`.
    ///
    /// The format comes from `path`; all reads and writes go to the payload.
    pub fn open_payload(
        path: impl AsRef<Path>,
        payload_path: impl AsRef<Path>,
        config: StorageConfig,
    ) -> DocumentResult<Self> {
        Self::load(path.as_ref(), payload_path.as_ref(), config)
    }

    fn load(path: &Path, payload_path: &Path, config: StorageConfig) -> DocumentResult<Self> {
        let started_at = Instant::now();
        let format =
            format_for_path(path).ok_or_else(|| DocumentError::UnsupportedFormat(path.to_path_buf()))?;
        let mut backend = backend_for(format.doc_type, config.clone());
        let mut tree = NoteTree::new();

        let mut sink = PopulateSink::new(&mut tree, payload_path);
        if let Err(err) = backend.populate(payload_path, &mut sink) {
            backend.close();
            error!(
                "event=doc_open module=document status=error duration_ms={} error={err}",
                started_at.elapsed().as_millis()
            );
            return Err(err.into());
        }
        sink.finish();

        info!(
            "event=doc_open module=document status=ok kind={:?} wrapped={} nodes={} duration_ms={}",
            format.doc_type,
            format.is_wrapped,
            tree.len(),
            started_at.elapsed().as_millis()
        );
        Ok(Self {
            path: path.to_path_buf(),
            payload_path: payload_path.to_path_buf(),
            format,
            config,
            backend,
            tree,
            needs_full_write: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn payload_path(&self) -> &Path {
        &self.payload_path
    }

    pub fn format(&self) -> DocFormat {
        self.format
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn tree(&self) -> &NoteTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut NoteTree {
        &mut self.tree
    }

    /// Whether a save would write anything.
    pub fn is_dirty(&self) -> bool {
        self.needs_full_write || self.tree.is_dirty()
    }

    /// Persists pending changes, keeping rotating backups of the previous
    /// file.
    pub fn save(&mut self) -> DocumentResult<()> {
        let started_at = Instant::now();
        if !self.is_dirty() {
            info!("event=doc_save module=document status=skip reason=clean");
            return Ok(());
        }
        let full_rewrite = self.needs_full_write;
        if full_rewrite {
            self.preload_bodies()?;
        }

        let staged = match backup::stage(&self.payload_path, &self.config) {
            Ok(staged) => staged,
            Err(err) => {
                warn!("event=backup_stage module=document status=error error={err}");
                None
            }
        };

        let pending = self.tree.drain_pending();
        let result = self
            .backend
            .save(&self.payload_path, &self.tree, &pending, full_rewrite);
        match result {
            Ok(()) => {
                self.needs_full_write = false;
                if let Some(staged) = staged {
                    if let Err(err) = backup::rotate(&staged, &self.payload_path, &self.config) {
                        warn!("event=backup_rotate module=document status=error error={err}");
                    }
                }
                info!(
                    "event=doc_save module=document status=ok full={full_rewrite} duration_ms={}",
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                self.tree.restore_pending(pending);
                if let Some(staged) = staged {
                    if let Err(discard_err) = backup::discard(&staged) {
                        warn!(
                            "event=backup_discard module=document status=error error={discard_err}"
                        );
                    }
                }
                error!(
                    "event=doc_save module=document status=error full={full_rewrite} duration_ms={} error={err}",
                    started_at.elapsed().as_millis()
                );
                Err(err.into())
            }
        }
    }

    /// Writes the whole document to a new plain file and continues there.
    pub fn save_as(&mut self, new_path: impl AsRef<Path>) -> DocumentResult<()> {
        let new_path = new_path.as_ref();
        plain_format(new_path)?;
        self.save_as_payload(new_path, new_path)
    }

    /// Writes the whole document to `payload_path`, adopting the format of
    /// `new_path`.
    pub fn save_as_payload(
        &mut self,
        new_path: impl AsRef<Path>,
        payload_path: impl AsRef<Path>,
    ) -> DocumentResult<()> {
        let started_at = Instant::now();
        let new_path = new_path.as_ref();
        let payload_path = payload_path.as_ref();
        let format = format_for_path(new_path)
            .ok_or_else(|| DocumentError::UnsupportedFormat(new_path.to_path_buf()))?;
        self.preload_bodies()?;

        let mut backend = backend_for(format.doc_type, self.config.clone());
        let pending = self.tree.drain_pending();
        if let Err(err) = backend.save(payload_path, &self.tree, &pending, true) {
            backend.close();
            self.tree.restore_pending(pending);
            error!(
                "event=doc_save_as module=document status=error duration_ms={} error={err}",
                started_at.elapsed().as_millis()
            );
            return Err(err.into());
        }

        self.backend.close();
        self.backend = backend;
        self.path = new_path.to_path_buf();
        self.payload_path = payload_path.to_path_buf();
        self.format = format;
        self.needs_full_write = false;
        info!(
            "event=doc_save_as module=document status=ok kind={:?} duration_ms={}",
            format.doc_type,
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    /// Compacts the file; saves first when the file does not exist yet.
    pub fn vacuum(&mut self) -> DocumentResult<()> {
        if self.needs_full_write {
            self.save()?;
        }
        self.backend.vacuum(&self.payload_path)?;
        Ok(())
    }

    /// Body of `id`, fetched on first access and cached in the tree.
    pub fn body(&mut self, id: NodeId) -> DocumentResult<&Body> {
        self.ensure_body(id)?;
        self.tree
            .body(id)?
            .ok_or(DocumentError::Tree(TreeError::BodyNotResident(id)))
    }

    /// Deletes `id` with its subtree after loading the bodies that must
    /// survive in promoted shared members.
    pub fn delete_node(&mut self, id: NodeId) -> DocumentResult<Vec<NodeId>> {
        for node in self.tree.subtree_of(id)? {
            let is_member = self
                .tree
                .get(node)
                .map_or(false, |record| record.is_shared_member());
            if !is_member && self.tree.is_shared(node)? {
                self.ensure_body(node)?;
            }
        }
        Ok(self.tree.delete(id)?)
    }

    /// Grafts the top-level nodes of `source` under `parent`.
    pub fn import(
        &mut self,
        source: impl AsRef<Path>,
        parent: Option<NodeId>,
    ) -> DocumentResult<Vec<NodeId>> {
        Ok(self
            .backend
            .import_subtree(source.as_ref(), &mut self.tree, parent)?)
    }

    /// Releases the backend handle.
    pub fn close(mut self) {
        self.backend.close();
        info!("event=doc_close module=document status=ok");
    }

    fn ensure_body(&mut self, id: NodeId) -> DocumentResult<NodeId> {
        let owner = self.tree.resolve_master(id)?;
        if self.tree.body(owner)?.is_none() {
            let body = self.backend.fetch_body(owner)?.unwrap_or_default();
            self.tree.cache_body(owner, body)?;
        }
        Ok(owner)
    }

    fn preload_bodies(&mut self) -> DocumentResult<()> {
        for id in self.tree.preorder() {
            let is_member = self
                .tree
                .get(id)
                .map_or(false, |record| record.is_shared_member());
            if !is_member {
                self.ensure_body(id)?;
            }
        }
        Ok(())
    }
}
