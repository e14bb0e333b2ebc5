//! Vector collections.
//!
//! A collection groups vectors of one dimensionality under a name, declares
//! the default distance metric and an optional metadata schema, and owns one
//! or more named indexes that all satisfy the pluggable [`VectorIndex`]
//! contract.

use crate::index::VectorIndex;
use lattice_core::{
    now_nanos, DistanceMetric, LatticeError, MetadataFilter, MetadataSchema, Result, SearchParams,
    SearchResult, Vector, VectorId,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

/// A named set of vectors sharing a dimension and metric.
pub struct Collection {
    name: String,
    dimension: usize,
    metric: DistanceMetric,
    schema: RwLock<Option<MetadataSchema>>,
    /// Named indexes in registration order; the first is the default for
    /// search.
    indexes: RwLock<Vec<(String, Box<dyn VectorIndex>)>>,
    created_at: i64,
    updated_at: AtomicI64,
}

impl Collection {
    /// Creates an empty collection with no indexes.
    pub fn new(name: impl Into<String>, dimension: usize, metric: DistanceMetric) -> Self {
        let now = now_nanos();
        Self {
            name: name.into(),
            dimension,
            metric,
            schema: RwLock::new(None),
            indexes: RwLock::new(Vec::new()),
            created_at: now,
            updated_at: AtomicI64::new(now),
        }
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed dimension for all vectors in the collection.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Default distance metric.
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Creation timestamp in nanoseconds since epoch.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Last-update timestamp in nanoseconds since epoch.
    pub fn updated_at(&self) -> i64 {
        self.updated_at.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.updated_at.store(now_nanos(), Ordering::Relaxed);
    }

    /// Declares the metadata schema checked on every insert.
    pub fn set_schema(&self, schema: MetadataSchema) {
        *self.schema.write() = Some(schema);
        self.touch();
    }

    /// Registers a named index.
    ///
    /// Fails if the index dimension disagrees with the collection's.
    pub fn add_index(&self, name: impl Into<String>, index: Box<dyn VectorIndex>) -> Result<()> {
        if index.dimension() != self.dimension {
            return Err(LatticeError::DimensionMismatch {
                expected: self.dimension,
                actual: index.dimension(),
            });
        }
        self.indexes.write().push((name.into(), index));
        self.touch();
        Ok(())
    }

    /// Names of registered indexes, in registration order.
    pub fn index_names(&self) -> Vec<String> {
        self.indexes
            .read()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Validates a vector against the collection dimension and schema
    /// without inserting it.
    pub fn validate(&self, vector: &Vector) -> Result<()> {
        if vector.dimension() != self.dimension {
            return Err(LatticeError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.dimension(),
            });
        }
        if let Some(schema) = self.schema.read().as_ref() {
            if !schema.is_empty() {
                schema.validate(vector.metadata.as_ref())?;
            }
        }
        Ok(())
    }

    /// Inserts a vector into every index.
    pub fn insert(&self, vector: &Vector) -> Result<()> {
        self.validate(vector)?;
        let indexes = self.indexes.read();
        for (_, index) in indexes.iter() {
            index.insert(vector)?;
        }
        drop(indexes);
        self.touch();
        Ok(())
    }

    /// Inserts a batch, validating every vector before touching any index.
    pub fn batch_insert(&self, vectors: &[Vector]) -> Result<()> {
        for vector in vectors {
            self.validate(vector)?;
        }
        let indexes = self.indexes.read();
        for (_, index) in indexes.iter() {
            index.batch_insert(vectors)?;
        }
        drop(indexes);
        self.touch();
        Ok(())
    }

    /// Soft-deletes a vector from every index.
    pub fn delete(&self, id: &VectorId) -> Result<()> {
        let indexes = self.indexes.read();
        for (_, index) in indexes.iter() {
            index.delete(id)?;
        }
        drop(indexes);
        self.touch();
        Ok(())
    }

    /// Searches the default (first-registered) index.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
        params: &SearchParams,
    ) -> Result<Vec<SearchResult>> {
        if query.len() != self.dimension {
            return Err(LatticeError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let indexes = self.indexes.read();
        let (_, index) = indexes.first().ok_or_else(|| {
            LatticeError::InvalidQuery(format!("no indexes available in collection {}", self.name))
        })?;
        index.search(query, k, filter, params)
    }

    /// Searches a specific named index.
    pub fn search_with(
        &self,
        index_name: &str,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
        params: &SearchParams,
    ) -> Result<Vec<SearchResult>> {
        let indexes = self.indexes.read();
        let (_, index) = indexes
            .iter()
            .find(|(name, _)| name == index_name)
            .ok_or_else(|| {
                LatticeError::InvalidQuery(format!("unknown index {}", index_name))
            })?;
        index.search(query, k, filter, params)
    }

    /// Number of live vectors, as reported by the default index.
    pub fn size(&self) -> usize {
        self.indexes
            .read()
            .first()
            .map(|(_, index)| index.size())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("dimension", &self.dimension)
            .field("metric", &self.metric)
            .field("indexes", &self.index_names())
            .finish()
    }
}
