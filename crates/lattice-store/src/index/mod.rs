//! Pluggable vector index contract.
//!
//! Indexes sit behind a capability set rather than an inheritance hierarchy:
//! any type implementing [`VectorIndex`] can be registered on a collection.
//! The reference implementation is the brute-force [`LinearIndex`]; smarter
//! approximate indexes plug into the same contract.

mod linear;

pub use linear::LinearIndex;

use lattice_core::{MetadataFilter, Result, SearchParams, SearchResult, Vector, VectorId};

/// The operation tuple every index must satisfy.
///
/// Implementations use interior locking; all methods take `&self` so
/// collections can share indexes behind `Box<dyn VectorIndex>`.
pub trait VectorIndex: Send + Sync {
    /// Inserts a vector. The index stores its own copy.
    fn insert(&self, vector: &Vector) -> Result<()>;

    /// Inserts a batch of vectors.
    fn batch_insert(&self, vectors: &[Vector]) -> Result<()> {
        for vector in vectors {
            self.insert(vector)?;
        }
        Ok(())
    }

    /// Soft-deletes a vector by id.
    fn delete(&self, id: &VectorId) -> Result<()>;

    /// Returns up to `k` nearest neighbors, best first.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
        params: &SearchParams,
    ) -> Result<Vec<SearchResult>>;

    /// Number of live (non-deleted) vectors.
    fn size(&self) -> usize;

    /// Index dimensionality.
    fn dimension(&self) -> usize;

    /// Loads persisted state. Purely in-memory indexes return success.
    fn load(&self) -> Result<()> {
        Ok(())
    }

    /// Persists state. Purely in-memory indexes return success.
    fn save(&self) -> Result<()> {
        Ok(())
    }
}
