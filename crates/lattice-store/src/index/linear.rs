//! Brute-force reference index.
//!
//! Performs an exhaustive scan over all live entries. Not efficient for
//! large datasets, but exact, and the baseline every approximate index is
//! measured against. Above [`PARALLEL_THRESHOLD`] entries the scan fans out
//! across the rayon worker pool, each worker folding candidates into a
//! bounded top-k heap that is then merged.

use crate::distance::{distance_fn, higher_is_better, normalize, normalize_score, DistanceFn};
use crate::index::VectorIndex;
use lattice_core::{
    DistanceMetric, LatticeError, MetadataFilter, Result, SearchParams, SearchResult, Vector,
    VectorId,
};
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Dataset size at which the scan switches to the parallel path.
const PARALLEL_THRESHOLD: usize = 1000;

/// Exhaustive-scan vector index.
pub struct LinearIndex {
    dimension: usize,
    metric: DistanceMetric,
    distance: DistanceFn,
    /// Stored copies are pre-normalized for cosine so each comparison is a
    /// single inner product.
    keep_normalized: bool,
    vectors: RwLock<HashMap<VectorId, Vector>>,
}

impl LinearIndex {
    /// Creates a new index for the given dimension and metric.
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            distance: distance_fn(metric),
            keep_normalized: metric == DistanceMetric::Cosine,
            vectors: RwLock::new(HashMap::new()),
        }
    }

    /// The index's distance metric.
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn score_entry(
        &self,
        query: &[f32],
        vector: &Vector,
        filter: Option<&MetadataFilter>,
        score_threshold: Option<f32>,
    ) -> Option<Candidate> {
        if vector.deleted {
            return None;
        }
        if let Some(filter) = filter {
            if !filter.matches(vector.metadata.as_ref()) {
                return None;
            }
        }

        let distance = (self.distance)(query, &vector.values);
        let score = normalize_score(distance, self.metric);
        if let Some(threshold) = score_threshold {
            if score < threshold {
                return None;
            }
        }

        let goodness = if higher_is_better(self.metric) {
            distance
        } else {
            -distance
        };
        Some(Candidate {
            goodness: OrderedFloat(goodness),
            id: vector.id.clone(),
            distance,
            score,
        })
    }
}

impl VectorIndex for LinearIndex {
    fn insert(&self, vector: &Vector) -> Result<()> {
        if vector.dimension() != self.dimension {
            return Err(LatticeError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.dimension(),
            });
        }

        let mut copy = vector.clone();
        if self.keep_normalized {
            normalize(&mut copy.values);
        }

        self.vectors.write().insert(copy.id.clone(), copy);
        Ok(())
    }

    fn delete(&self, id: &VectorId) -> Result<()> {
        let mut vectors = self.vectors.write();
        match vectors.get_mut(id) {
            Some(vector) => {
                vector.mark_deleted();
                Ok(())
            }
            None => Err(LatticeError::NotFound(id.clone())),
        }
    }

    fn search(
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
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        if self.keep_normalized {
            normalize(&mut query);
        }

        let vectors = self.vectors.read();
        let threshold = params.score_threshold;
        let deadline = params
            .timeout_ms
            .map(|ms| std::time::Instant::now() + std::time::Duration::from_millis(ms));
        let expired = || deadline.is_some_and(|d| std::time::Instant::now() >= d);

        let top = if vectors.len() >= PARALLEL_THRESHOLD {
            vectors
                .par_iter()
                .fold(
                    || TopK::new(k),
                    |mut top, (_, vector)| {
                        if expired() {
                            return top;
                        }
                        if let Some(c) = self.score_entry(&query, vector, filter, threshold) {
                            top.push(c);
                        }
                        top
                    },
                )
                .reduce(|| TopK::new(k), TopK::merge)
        } else {
            let mut top = TopK::new(k);
            for (scanned, vector) in vectors.values().enumerate() {
                // Deadlines are observed between candidate batches.
                if scanned % 256 == 0 && expired() {
                    break;
                }
                if let Some(c) = self.score_entry(&query, vector, filter, threshold) {
                    top.push(c);
                }
            }
            top
        };

        let results = top
            .into_sorted()
            .into_iter()
            .map(|c| {
                let vector = vectors.get(&c.id).cloned();
                SearchResult {
                    id: c.id,
                    distance: c.distance,
                    score: c.score,
                    vector,
                }
            })
            .collect();

        Ok(results)
    }

    fn size(&self) -> usize {
        self.vectors.read().values().filter(|v| !v.deleted).count()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// A scored candidate during the scan.
///
/// Ordering is "worse is greater": lower goodness first, then larger id, so
/// a max-heap pops the worst entry and `sort` yields best-first.
struct Candidate {
    goodness: OrderedFloat<f32>,
    id: VectorId,
    distance: f32,
    score: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .goodness
            .cmp(&self.goodness)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Bounded best-k collector over [`Candidate`]s.
struct TopK {
    heap: BinaryHeap<Candidate>,
    k: usize,
}

impl TopK {
    fn new(k: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(k + 1),
            k,
        }
    }

    fn push(&mut self, candidate: Candidate) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(worst) = self.heap.peek() {
            if candidate.cmp(worst) == Ordering::Less {
                self.heap.pop();
                self.heap.push(candidate);
            }
        }
    }

    fn merge(mut self, other: TopK) -> TopK {
        for candidate in other.heap {
            self.push(candidate);
        }
        self
    }

    fn into_sorted(self) -> Vec<Candidate> {
        let mut v = self.heap.into_vec();
        v.sort();
        v
    }
}
