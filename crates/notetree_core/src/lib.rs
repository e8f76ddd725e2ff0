//! Core engine for hierarchical note documents.
//! This crate is the single source of truth for tree invariants and the
//! persisted formats.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod service;
pub mod storage;
pub mod tree;

pub use config::StorageConfig;
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::node::{
    AnchoredKind, AnchoredObject, AnchoredPayload, Body, ContentKind, Justification, NodeId,
    NodeRecord, Rgb,
};
pub use service::{Document, DocumentError, DocumentResult};
pub use storage::{
    format_for_path, DocFormat, DocType, ImportError, LoadError, NodeSink, SaveError,
    StorageBackend,
};
pub use tree::sync::{NodeSyncState, SyncPending};
pub use tree::{NodeProperty, NoteTree, TreeError, TreeNode, TreeResult};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
