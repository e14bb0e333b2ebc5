//! Dense and sparse vector types.
//!
//! A [`Vector`] is the unit of storage and replication: a stable id, a
//! fixed-length `f32` coordinate sequence, an optional typed attribute bag,
//! an epoch-nanosecond timestamp, and a soft-deletion marker. Cloning a
//! vector yields a deep copy; the store relies on this to keep callers from
//! mutating stored state.

use crate::metadata::FieldValue;
use crate::{LatticeError, Result, VectorId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Optional attribute bag attached to a vector.
pub type Metadata = HashMap<String, FieldValue>;

/// Returns the current wall-clock time as nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// A dense high-dimensional embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    /// Unique identifier.
    pub id: VectorId,
    /// Coordinate values; length equals the enclosing collection's dimension.
    pub values: Vec<f32>,
    /// Optional associated metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Creation/modification timestamp in nanoseconds since epoch.
    pub timestamp: i64,
    /// Soft-deletion marker.
    #[serde(default)]
    pub deleted: bool,
}

impl Vector {
    /// Creates a new vector stamped with the current time.
    pub fn new(id: impl Into<VectorId>, values: Vec<f32>, metadata: Option<Metadata>) -> Self {
        Self {
            id: id.into(),
            values,
            metadata,
            timestamp: now_nanos(),
            deleted: false,
        }
    }

    /// Returns the dimensionality of the vector.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Normalizes the vector in place to unit L2 length.
    ///
    /// A zero vector is left unchanged.
    pub fn normalize(&mut self) {
        let sum: f32 = self.values.iter().map(|v| v * v).sum();
        if sum == 0.0 {
            return;
        }
        let magnitude = sum.sqrt();
        for v in &mut self.values {
            *v /= magnitude;
        }
    }

    /// Marks the vector as soft-deleted and refreshes its timestamp.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.timestamp = now_nanos();
    }

    /// Refreshes the modification timestamp.
    pub fn touch(&mut self) {
        self.timestamp = now_nanos();
    }

    /// Approximate in-memory footprint in bytes.
    ///
    /// Used by the transfer layer for byte-progress accounting; the metadata
    /// contribution is an estimate.
    pub fn approx_size_bytes(&self) -> usize {
        let mut size = self.id.as_str().len() + std::mem::size_of::<Self>();
        size += self.values.len() * std::mem::size_of::<f32>();
        if let Some(metadata) = &self.metadata {
            for (key, value) in metadata {
                size += key.len() + value.approx_size_bytes();
            }
        }
        size
    }
}

/// A sparse vector with explicit indices and values.
///
/// Invariants, checked by [`SparseVector::validate`]: `indices` strictly
/// increasing, every index less than `dim`, and `indices`/`values` of equal
/// length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    /// Unique identifier.
    pub id: VectorId,
    /// Indices of non-zero elements, strictly increasing.
    pub indices: Vec<usize>,
    /// Values at those indices.
    pub values: Vec<f32>,
    /// Declared ambient dimension.
    pub dim: usize,
    /// Optional associated metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Creation/modification timestamp in nanoseconds since epoch.
    pub timestamp: i64,
    /// Soft-deletion marker.
    #[serde(default)]
    pub deleted: bool,
}

impl SparseVector {
    /// Creates a new sparse vector stamped with the current time.
    pub fn new(
        id: impl Into<VectorId>,
        indices: Vec<usize>,
        values: Vec<f32>,
        dim: usize,
        metadata: Option<Metadata>,
    ) -> Self {
        Self {
            id: id.into(),
            indices,
            values,
            dim,
            metadata,
            timestamp: now_nanos(),
            deleted: false,
        }
    }

    /// Checks the sparse-vector invariants.
    pub fn validate(&self) -> Result<()> {
        if self.indices.len() != self.values.len() {
            return Err(LatticeError::InvalidSparseVector(format!(
                "indices/values length mismatch: {} vs {}",
                self.indices.len(),
                self.values.len()
            )));
        }
        for window in self.indices.windows(2) {
            if window[0] >= window[1] {
                return Err(LatticeError::InvalidSparseVector(format!(
                    "indices not strictly increasing at {} >= {}",
                    window[0], window[1]
                )));
            }
        }
        if let Some(&last) = self.indices.last() {
            if last >= self.dim {
                return Err(LatticeError::InvalidSparseVector(format!(
                    "index {} out of range for dimension {}",
                    last, self.dim
                )));
            }
        }
        Ok(())
    }

    /// Materializes the sparse vector as a dense [`Vector`].
    pub fn to_dense(&self) -> Result<Vector> {
        self.validate()?;
        let mut values = vec![0.0f32; self.dim];
        for (&idx, &val) in self.indices.iter().zip(self.values.iter()) {
            values[idx] = val;
        }
        Ok(Vector {
            id: self.id.clone(),
            values,
            metadata: self.metadata.clone(),
            timestamp: self.timestamp,
            deleted: self.deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_vector_is_live() {
        let v = Vector::new("v1", vec![1.0, 2.0, 3.0], None);
        assert_eq!(v.dimension(), 3);
        assert!(!v.deleted);
        assert!(v.timestamp > 0);
    }

    #[test]
    fn test_clone_is_deep() {
        let v = Vector::new("v1", vec![1.0, 0.0], None);
        let mut copy = v.clone();
        copy.values[0] = 9.0;
        assert_eq!(v.values[0], 1.0);
    }

    #[test]
    fn test_normalize() {
        let mut v = Vector::new("v1", vec![3.0, 4.0], None);
        v.normalize();
        assert!((v.values[0] - 0.6).abs() < 1e-6);
        assert!((v.values[1] - 0.8).abs() < 1e-6);

        let mut zero = Vector::new("z", vec![0.0, 0.0], None);
        zero.normalize();
        assert_eq!(zero.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_mark_deleted_advances_timestamp() {
        let mut v = Vector::new("v1", vec![1.0], None);
        let before = v.timestamp;
        v.mark_deleted();
        assert!(v.deleted);
        assert!(v.timestamp >= before);
    }

    #[test]
    fn test_approx_size_grows_with_values() {
        let small = Vector::new("v", vec![0.0; 4], None);
        let large = Vector::new("v", vec![0.0; 400], None);
        assert!(large.approx_size_bytes() > small.approx_size_bytes());
    }

    #[test]
    fn test_sparse_validate_ok() {
        let sv = SparseVector::new("s1", vec![0, 3, 7], vec![1.0, 2.0, 3.0], 8, None);
        assert!(sv.validate().is_ok());
    }

    #[test]
    fn test_sparse_validate_rejects_unsorted() {
        let sv = SparseVector::new("s1", vec![3, 1], vec![1.0, 2.0], 8, None);
        assert!(matches!(
            sv.validate(),
            Err(LatticeError::InvalidSparseVector(_))
        ));
    }

    #[test]
    fn test_sparse_validate_rejects_out_of_range() {
        let sv = SparseVector::new("s1", vec![0, 8], vec![1.0, 2.0], 8, None);
        assert!(sv.validate().is_err());
    }

    #[test]
    fn test_sparse_validate_rejects_length_mismatch() {
        let sv = SparseVector::new("s1", vec![0, 1], vec![1.0], 8, None);
        assert!(sv.validate().is_err());
    }

    #[test]
    fn test_sparse_to_dense() {
        let sv = SparseVector::new("s1", vec![1, 3], vec![2.0, 4.0], 5, None);
        let dense = sv.to_dense().unwrap();
        assert_eq!(dense.values, vec![0.0, 2.0, 0.0, 4.0, 0.0]);
        assert_eq!(dense.id, VectorId::new("s1"));
    }
}
