//! Document-level services.
//!
//! # Responsibility
//! - Bind a tree to its storage backend for open/save/save-as.
//! - Keep editor layers decoupled from physical formats.

pub mod backup;
pub mod document;

pub use document::{Document, DocumentError, DocumentResult};
