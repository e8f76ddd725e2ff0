//! Document domain model.
//!
//! # Responsibility
//! - Define the node record, body and anchored object shapes.
//! - Keep the packed integer flag encodings in one place.
//!
//! # Invariants
//! - Every node is identified by a document-unique, non-zero `NodeId`.
//! - Packed encodings are pure functions with round-trip tests.

pub mod flags;
pub mod node;
