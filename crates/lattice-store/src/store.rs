//! Node-local vector store.
//!
//! The store owns the subset of vectors the token ring places on this node,
//! serves reads and writes under a reader/writer lock, and dispatches
//! searches to the collection's indexes. Writes addressed to a vector this
//! node does not own are silently dropped (logged at debug); the
//! inter-node replication path uses [`VectorStore::receive_vectors`], which
//! bypasses the locality check and resolves conflicts last-writer-wins by
//! timestamp.

use crate::collection::Collection;
use crate::index::LinearIndex;
use crate::ring::TokenRing;
use lattice_core::{
    DistanceMetric, LatticeError, MetadataFilter, MetadataSchema, NodeId, Result, SearchParams,
    SearchResult, Vector, VectorId,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Construction parameters for a [`VectorStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// This node's identifier.
    pub node_id: NodeId,
    /// Fixed vector dimensionality.
    pub dimensions: usize,
    /// Distance metric served by the default index.
    pub metric: DistanceMetric,
}

/// Point-in-time statistics for the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub node_id: NodeId,
    pub dimensions: usize,
    pub distance_function: DistanceMetric,
    /// Live vectors held by this node.
    pub total_vectors: usize,
    /// Live vectors this node actually owns under the current ring.
    pub local_vectors: usize,
}

/// In-memory vector store for one node.
pub struct VectorStore {
    node_id: NodeId,
    dimensions: usize,
    metric: DistanceMetric,
    vectors: RwLock<HashMap<VectorId, Vector>>,
    collection: Collection,
    ring: RwLock<Option<Arc<RwLock<TokenRing>>>>,
}

impl VectorStore {
    /// Creates a store with a default linear index.
    pub fn new(config: StoreConfig) -> Result<Self> {
        if config.dimensions == 0 {
            return Err(LatticeError::InvalidConfig(
                "dimensions must be greater than 0".to_string(),
            ));
        }

        let collection = Collection::new("default", config.dimensions, config.metric);
        collection.add_index(
            "linear",
            Box::new(LinearIndex::new(config.dimensions, config.metric)),
        )?;

        info!(
            node_id = %config.node_id,
            dimensions = config.dimensions,
            metric = %config.metric,
            "created vector store"
        );

        Ok(Self {
            node_id: config.node_id,
            dimensions: config.dimensions,
            metric: config.metric,
            vectors: RwLock::new(HashMap::new()),
            collection,
            ring: RwLock::new(None),
        })
    }

    /// This node's identifier.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Store dimensionality.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Distance metric of the default index.
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// The underlying collection.
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Declares the metadata schema enforced on writes.
    pub fn set_schema(&self, schema: MetadataSchema) {
        self.collection.set_schema(schema);
    }

    /// Attaches the shared token ring used for locality checks.
    pub fn set_ring(&self, ring: Arc<RwLock<TokenRing>>) {
        let nodes = ring.read().node_count();
        info!(node_id = %self.node_id, nodes, "token ring attached");
        *self.ring.write() = Some(ring);
    }

    /// Returns true if this node is among the owners of the id.
    ///
    /// Without an attached ring every id is considered local.
    pub fn is_owner(&self, id: &VectorId) -> bool {
        match self.ring.read().as_ref() {
            Some(ring) => ring.read().owners(id).contains(&self.node_id),
            None => true,
        }
    }

    /// Writes a vector.
    ///
    /// Fails fast on dimension or schema violations. If a ring is attached
    /// and this node is not an owner of the id, the call is a silent no-op.
    /// The stored copy is deep and gets a fresh timestamp; a re-put of a
    /// soft-deleted id revives it.
    pub fn put(&self, vector: &Vector) -> Result<()> {
        self.collection.validate(vector)?;

        if !self.is_owner(&vector.id) {
            debug!(node_id = %self.node_id, vector_id = %vector.id, "vector does not belong on this node, dropping");
            return Ok(());
        }

        let mut copy = vector.clone();
        copy.deleted = false;
        copy.touch();

        self.vectors.write().insert(copy.id.clone(), copy.clone());
        self.collection.insert(&copy)?;
        debug!(vector_id = %vector.id, "stored vector");
        Ok(())
    }

    /// Reads a vector by id, returning a deep copy.
    ///
    /// Soft-deleted entries report `not-found`.
    pub fn get(&self, id: &VectorId) -> Result<Vector> {
        let vectors = self.vectors.read();
        match vectors.get(id) {
            Some(vector) if !vector.deleted => Ok(vector.clone()),
            _ => Err(LatticeError::NotFound(id.clone())),
        }
    }

    /// Soft-deletes a vector.
    ///
    /// The entry stays addressable for the compaction window but is excluded
    /// from search results and size counts. Deleting an already-deleted id
    /// is a no-op; deleting an unknown id is `not-found`.
    pub fn delete(&self, id: &VectorId) -> Result<()> {
        let mut vectors = self.vectors.write();
        match vectors.get_mut(id) {
            Some(vector) if vector.deleted => return Ok(()),
            Some(vector) => vector.mark_deleted(),
            None => return Err(LatticeError::NotFound(id.clone())),
        }
        drop(vectors);

        self.collection.delete(id)?;
        debug!(vector_id = %id, "soft-deleted vector");
        Ok(())
    }

    /// Writes a batch, validating every vector before applying any.
    ///
    /// Returns the number of vectors actually stored (locality no-ops are
    /// not counted).
    pub fn batch_put(&self, vectors: &[Vector]) -> Result<usize> {
        for vector in vectors {
            self.collection.validate(vector)?;
        }
        let mut applied = 0;
        for vector in vectors {
            if self.is_owner(&vector.id) {
                self.put(vector)?;
                applied += 1;
            } else {
                debug!(vector_id = %vector.id, "batch entry does not belong on this node, dropping");
            }
        }
        Ok(applied)
    }

    /// Soft-deletes a batch of ids; unknown ids are skipped.
    pub fn batch_delete(&self, ids: &[VectorId]) -> Result<()> {
        for id in ids {
            match self.delete(id) {
                Ok(()) => {}
                Err(LatticeError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Applies vectors arriving from a peer transfer.
    ///
    /// Unlike [`VectorStore::put`], this path does not consult the ring:
    /// during a rebalance the destination receives data before the new ring
    /// is committed. Conflicts resolve last-writer-wins by timestamp, with
    /// the incoming copy winning ties. Returns the byte volume applied.
    pub fn receive_vectors(&self, vectors: &[Vector]) -> Result<u64> {
        for vector in vectors {
            self.collection.validate(vector)?;
        }

        let mut bytes = 0u64;
        for incoming in vectors {
            {
                let existing = self.vectors.read();
                if let Some(current) = existing.get(&incoming.id) {
                    if current.timestamp > incoming.timestamp {
                        debug!(vector_id = %incoming.id, "kept newer local copy");
                        continue;
                    }
                }
            }

            bytes += incoming.approx_size_bytes() as u64;
            self.vectors
                .write()
                .insert(incoming.id.clone(), incoming.clone());
            self.collection.insert(incoming)?;
        }

        debug!(count = vectors.len(), bytes, "received vectors from peer");
        Ok(bytes)
    }

    /// Searches the default index.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
        params: &SearchParams,
    ) -> Result<Vec<SearchResult>> {
        self.collection.search(query, k, filter, params)
    }

    /// All live vector ids held by this node.
    pub fn all_ids(&self) -> Vec<VectorId> {
        self.vectors
            .read()
            .values()
            .filter(|v| !v.deleted)
            .map(|v| v.id.clone())
            .collect()
    }

    /// Live vector ids this node owns under the current ring.
    ///
    /// Without a ring, all held ids are local.
    pub fn local_ids(&self) -> Vec<VectorId> {
        let ring = self.ring.read().clone();
        let vectors = self.vectors.read();
        match ring {
            None => vectors
                .values()
                .filter(|v| !v.deleted)
                .map(|v| v.id.clone())
                .collect(),
            Some(ring) => {
                let ring = ring.read();
                vectors
                    .values()
                    .filter(|v| !v.deleted)
                    .filter(|v| ring.owners(&v.id).contains(&self.node_id))
                    .map(|v| v.id.clone())
                    .collect()
            }
        }
    }

    /// Number of live vectors.
    pub fn size(&self) -> usize {
        self.vectors.read().values().filter(|v| !v.deleted).count()
    }

    /// Reclaims soft-deleted entries older than `window_nanos`.
    ///
    /// Returns the number of entries compacted away.
    pub fn compact(&self, window_nanos: i64) -> usize {
        let cutoff = lattice_core::now_nanos() - window_nanos;
        let mut vectors = self.vectors.write();
        let before = vectors.len();
        vectors.retain(|_, v| !(v.deleted && v.timestamp <= cutoff));
        let removed = before - vectors.len();
        if removed > 0 {
            info!(removed, "compacted soft-deleted vectors");
        }
        removed
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> StoreStats {
        let total = self.size();
        let local = self.local_ids().len();
        StoreStats {
            node_id: self.node_id.clone(),
            dimensions: self.dimensions,
            distance_function: self.metric,
            total_vectors: total,
            local_vectors: local,
        }
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("node_id", &self.node_id)
            .field("dimensions", &self.dimensions)
            .field("metric", &self.metric)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(node: &str) -> VectorStore {
        VectorStore::new(StoreConfig {
            node_id: NodeId::new(node),
            dimensions: 3,
            metric: DistanceMetric::Cosine,
        })
        .unwrap()
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let err = VectorStore::new(StoreConfig {
            node_id: NodeId::new("n1"),
            dimensions: 0,
            metric: DistanceMetric::Cosine,
        })
        .unwrap_err();
        assert!(matches!(err, LatticeError::InvalidConfig(_)));
    }

    #[test]
    fn test_put_get_roundtrip_preserves_values() {
        let s = store("n1");
        let v = Vector::new("v1", vec![0.25, -1.5, 3.0], None);
        s.put(&v).unwrap();

        let got = s.get(&VectorId::new("v1")).unwrap();
        assert_eq!(got.values, v.values);
        assert!(!got.deleted);
    }

    #[test]
    fn test_get_returns_copy() {
        let s = store("n1");
        s.put(&Vector::new("v1", vec![1.0, 0.0, 0.0], None)).unwrap();

        let mut got = s.get(&VectorId::new("v1")).unwrap();
        got.values[0] = 42.0;
        assert_eq!(s.get(&VectorId::new("v1")).unwrap().values[0], 1.0);
    }

    #[test]
    fn test_put_rejects_wrong_dimension() {
        let s = store("n1");
        let err = s.put(&Vector::new("v1", vec![1.0], None)).unwrap_err();
        assert!(matches!(err, LatticeError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_put_is_idempotent() {
        let s = store("n1");
        let v = Vector::new("v1", vec![1.0, 0.0, 0.0], None);
        s.put(&v).unwrap();
        let first = s.get(&VectorId::new("v1")).unwrap();
        s.put(&v).unwrap();
        let second = s.get(&VectorId::new("v1")).unwrap();
        assert_eq!(first.values, second.values);
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(s.size(), 1);
    }

    #[test]
    fn test_non_owner_put_is_silent_noop() {
        let s = store("n1");
        let mut ring = TokenRing::new(32, 1);
        // Only n2 is on the ring, so nothing belongs to n1.
        ring.add_node(&NodeId::new("n2"));
        s.set_ring(Arc::new(RwLock::new(ring)));

        s.put(&Vector::new("v1", vec![1.0, 0.0, 0.0], None)).unwrap();
        assert_eq!(s.size(), 0);
        assert!(s.get(&VectorId::new("v1")).is_err());
    }

    #[test]
    fn test_owner_put_succeeds_with_ring() {
        let s = store("n1");
        let mut ring = TokenRing::new(32, 1);
        ring.add_node(&NodeId::new("n1"));
        s.set_ring(Arc::new(RwLock::new(ring)));

        s.put(&Vector::new("v1", vec![1.0, 0.0, 0.0], None)).unwrap();
        assert_eq!(s.size(), 1);
        assert_eq!(s.local_ids().len(), 1);
    }

    #[test]
    fn test_soft_delete_lifecycle() {
        let s = store("n1");
        s.put(&Vector::new("v1", vec![1.0, 0.0, 0.0], None)).unwrap();
        assert_eq!(s.size(), 1);

        s.delete(&VectorId::new("v1")).unwrap();
        assert_eq!(s.size(), 0);
        assert!(matches!(
            s.get(&VectorId::new("v1")),
            Err(LatticeError::NotFound(_))
        ));
        let results = s
            .search(&[1.0, 0.0, 0.0], 1, None, &SearchParams::default())
            .unwrap();
        assert!(results.is_empty());

        // Idempotent: a second delete leaves the same state.
        s.delete(&VectorId::new("v1")).unwrap();
        assert_eq!(s.size(), 0);

        // Unknown id is not-found.
        assert!(s.delete(&VectorId::new("ghost")).is_err());
    }

    #[test]
    fn test_reput_revives_deleted_vector() {
        let s = store("n1");
        s.put(&Vector::new("v1", vec![1.0, 0.0, 0.0], None)).unwrap();
        s.delete(&VectorId::new("v1")).unwrap();
        s.put(&Vector::new("v1", vec![0.0, 1.0, 0.0], None)).unwrap();

        let got = s.get(&VectorId::new("v1")).unwrap();
        assert_eq!(got.values, vec![0.0, 1.0, 0.0]);
        assert_eq!(s.size(), 1);
    }

    #[test]
    fn test_batch_put_validates_everything_first() {
        let s = store("n1");
        let batch = vec![
            Vector::new("ok", vec![1.0, 0.0, 0.0], None),
            Vector::new("bad", vec![1.0], None),
        ];
        assert!(s.batch_put(&batch).is_err());
        assert_eq!(s.size(), 0);
    }

    #[test]
    fn test_batch_delete_skips_unknown() {
        let s = store("n1");
        s.put(&Vector::new("v1", vec![1.0, 0.0, 0.0], None)).unwrap();
        s.batch_delete(&[VectorId::new("v1"), VectorId::new("ghost")])
            .unwrap();
        assert_eq!(s.size(), 0);
    }

    #[test]
    fn test_receive_vectors_bypasses_locality() {
        let s = store("n1");
        let mut ring = TokenRing::new(32, 1);
        ring.add_node(&NodeId::new("n2"));
        s.set_ring(Arc::new(RwLock::new(ring)));

        let bytes = s
            .receive_vectors(&[Vector::new("v1", vec![1.0, 0.0, 0.0], None)])
            .unwrap();
        assert!(bytes > 0);
        assert_eq!(s.size(), 1);
    }

    #[test]
    fn test_receive_vectors_last_writer_wins() {
        let s = store("n1");
        let mut old = Vector::new("v1", vec![1.0, 0.0, 0.0], None);
        let mut new = Vector::new("v1", vec![0.0, 1.0, 0.0], None);
        old.timestamp = 100;
        new.timestamp = 200;

        s.receive_vectors(std::slice::from_ref(&new)).unwrap();
        s.receive_vectors(std::slice::from_ref(&old)).unwrap();

        // The stale copy must not clobber the newer one.
        let got = s.get(&VectorId::new("v1")).unwrap();
        assert_eq!(got.values, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_stats() {
        let s = store("n1");
        s.put(&Vector::new("v1", vec![1.0, 0.0, 0.0], None)).unwrap();
        s.put(&Vector::new("v2", vec![0.0, 1.0, 0.0], None)).unwrap();

        let stats = s.stats();
        assert_eq!(stats.total_vectors, 2);
        assert_eq!(stats.local_vectors, 2);
        assert_eq!(stats.dimensions, 3);
    }

    #[test]
    fn test_compact_reclaims_old_tombstones() {
        let s = store("n1");
        s.put(&Vector::new("v1", vec![1.0, 0.0, 0.0], None)).unwrap();
        s.delete(&VectorId::new("v1")).unwrap();

        // Window of zero: everything deleted before "now" is reclaimable.
        let removed = s.compact(0);
        assert_eq!(removed, 1);
        assert!(s.get(&VectorId::new("v1")).is_err());
    }
}
