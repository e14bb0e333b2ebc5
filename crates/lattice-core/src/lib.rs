//! # Lattice Core
//!
//! Core types for LatticeDB, a distributed in-memory vector store.
//!
//! This crate provides the fundamental building blocks:
//! - [`NodeId`] and [`VectorId`] - Type-safe identifiers
//! - [`Vector`] and [`SparseVector`] - Dense and sparse embeddings
//! - [`FieldValue`] / [`MetadataSchema`] - Typed attribute bags with validation
//! - [`MetadataFilter`] - Predicate filtering for search
//! - [`DistanceMetric`] and search parameter/result types
//! - [`LatticeError`] - The crate-wide error taxonomy

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod metadata;
pub mod search;
pub mod vector;

pub use metadata::{
    CompareOp, FieldSpec, FieldType, FieldValue, FilterCondition, FilterOperator, MetadataFilter,
    MetadataSchema,
};
pub use search::{DistanceMetric, SearchParams, SearchResult, SearchStrategy};
pub use vector::{now_nanos, Metadata, SparseVector, Vector};

// =============================================================================
// Identifiers (Newtypes for type safety)
// =============================================================================

/// A unique identifier for a cluster node.
///
/// Node ids are stable opaque strings (e.g. `"node-1"`). The newtype keeps
/// them from being confused with vector ids or plain addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id and returns the underlying string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A unique identifier for a stored vector.
///
/// Vector ids are stable opaque strings chosen by the client. Ordering is
/// lexicographic and is used as the deterministic tie-break in search
/// results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorId(String);

impl VectorId {
    /// Creates a new vector id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id and returns the underlying string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for VectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VectorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for VectorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Error taxonomy for LatticeDB operations.
///
/// User-visible calls fail fast with one of these kinds; background tasks
/// record failures in observable task state instead of propagating them to
/// callers.
#[derive(Debug, Error)]
pub enum LatticeError {
    /// Vector or query length does not match the collection dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Metadata does not conform to the declared schema.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// Id absent or soft-deleted.
    #[error("vector {0} not found")]
    NotFound(VectorId),

    /// Operation addressed to a node outside the vector's owner set.
    #[error("node is not an owner of vector {0}")]
    NotOwner(VectorId),

    /// Transient transport or peer failure during a transfer.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// Explicit user or shutdown cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// The ring has fewer than the requested number of distinct replicas.
    #[error("under-replicated: {have} of {want} replicas available")]
    UnderReplicated { have: usize, want: usize },

    /// The external replicated log refused a commit.
    #[error("log submit failed: {0}")]
    LogSubmitFailed(String),

    /// Distance function name not in the supported set.
    #[error("unsupported distance metric: {0}")]
    UnsupportedMetric(String),

    /// Sparse vector invariant violated (indices/values/dimension).
    #[error("invalid sparse vector: {0}")]
    InvalidSparseVector(String),

    /// Malformed query request.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Rejected node or store configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, LatticeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_roundtrip() {
        let id = NodeId::new("node-1");
        assert_eq!(id.as_str(), "node-1");
        assert_eq!(id.to_string(), "node-1");
        assert_eq!(NodeId::from("node-1"), id);
    }

    #[test]
    fn test_vector_id_ordering_is_lexicographic() {
        let a = VectorId::new("v1");
        let b = VectorId::new("v2");
        assert!(a < b);
        assert!(VectorId::new("v10") < VectorId::new("v2"));
    }

    #[test]
    fn test_ids_serialize_transparent() {
        let id = VectorId::new("vec-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"vec-42\"");
        let back: VectorId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_error_display() {
        let err = LatticeError::DimensionMismatch {
            expected: 3,
            actual: 4,
        };
        assert_eq!(err.to_string(), "dimension mismatch: expected 3, got 4");

        let err = LatticeError::NotFound(VectorId::new("v1"));
        assert_eq!(err.to_string(), "vector v1 not found");
    }
}
