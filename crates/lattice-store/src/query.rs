//! Unified query API.
//!
//! One request shape covers the ways a client can ask for vectors: kNN by
//! query vector, kNN by an existing point's id, recommendation from
//! positive/negative examples, cursor pagination, and random sampling.
//! Exactly one query type must be set per request.

use crate::store::VectorStore;
use lattice_core::{
    LatticeError, MetadataFilter, Result, SearchParams, SearchResult, SearchStrategy, VectorId,
};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Recommendation inputs: centroids of examples steer the query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendParams {
    /// Ids of positive examples; at least one is required.
    pub positive: Vec<VectorId>,
    /// Ids of negative examples, subtracted from the positive centroid.
    #[serde(default)]
    pub negative: Vec<VectorId>,
}

/// Cursor pagination through all live vectors in id order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrollParams {
    /// Resume strictly after this id; `None` starts from the beginning.
    #[serde(default)]
    pub cursor: Option<VectorId>,
}

/// A universal query request. Exactly one of `vector`, `point_id`,
/// `recommend`, `scroll`, or `sample` must be specified.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    /// kNN search by explicit query vector.
    pub vector: Option<Vec<f32>>,
    /// kNN search seeded by a stored vector.
    pub point_id: Option<VectorId>,
    /// Recommendation by example ids.
    pub recommend: Option<RecommendParams>,
    /// Pagination through all points.
    pub scroll: Option<ScrollParams>,
    /// Random sampling.
    pub sample: bool,

    /// Metadata predicate applied to candidates.
    pub filter: Option<MetadataFilter>,
    /// Search behavior configuration.
    pub params: Option<SearchParams>,
    /// Maximum results to return; defaults to 10.
    pub limit: usize,
    /// Results to skip before returning.
    pub offset: usize,
    /// Include vector payloads in the response.
    pub with_vectors: bool,
}

/// Response to a [`QueryRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<SearchResult>,
    /// Set by scroll queries when more pages remain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<VectorId>,
}

/// Executes [`QueryRequest`]s against a store.
pub struct QueryProcessor<'a> {
    store: &'a VectorStore,
}

impl<'a> QueryProcessor<'a> {
    /// Creates a processor over a store.
    pub fn new(store: &'a VectorStore) -> Self {
        Self { store }
    }

    /// Dispatches a request to the matching handler.
    pub fn process(&self, mut request: QueryRequest) -> Result<QueryResponse> {
        self.validate(&mut request)?;
        let params = self.effective_params(&request);

        if let Some(query) = request.vector.clone() {
            return self.vector_search(&query, &request, &params, &[]);
        }
        if let Some(point_id) = request.point_id.clone() {
            let seed = self.store.get(&point_id)?;
            return self.vector_search(&seed.values, &request, &params, &[point_id]);
        }
        if let Some(recommend) = request.recommend.clone() {
            let query = self.recommendation_query(&recommend)?;
            let mut exclude = recommend.positive.clone();
            exclude.extend(recommend.negative.iter().cloned());
            return self.vector_search(&query, &request, &params, &exclude);
        }
        if let Some(scroll) = request.scroll.clone() {
            return self.scroll(&scroll, &request);
        }
        // validate() guarantees `sample` here.
        self.sample(&request)
    }

    fn validate(&self, request: &mut QueryRequest) -> Result<()> {
        if request.limit == 0 {
            request.limit = 10;
        }

        let mut query_types = 0;
        if request.vector.is_some() {
            query_types += 1;
        }
        if request.point_id.is_some() {
            query_types += 1;
        }
        if request.recommend.is_some() {
            query_types += 1;
        }
        if request.scroll.is_some() {
            query_types += 1;
        }
        if request.sample {
            query_types += 1;
        }

        match query_types {
            0 => Err(LatticeError::InvalidQuery(
                "no query type specified".to_string(),
            )),
            1 => {
                if let Some(vector) = &request.vector {
                    if vector.len() != self.store.dimensions() {
                        return Err(LatticeError::DimensionMismatch {
                            expected: self.store.dimensions(),
                            actual: vector.len(),
                        });
                    }
                }
                if let Some(recommend) = &request.recommend {
                    if recommend.positive.is_empty() {
                        return Err(LatticeError::InvalidQuery(
                            "recommendation requires at least one positive example".to_string(),
                        ));
                    }
                }
                Ok(())
            }
            _ => Err(LatticeError::InvalidQuery(
                "multiple query types specified, only one is allowed".to_string(),
            )),
        }
    }

    /// Resolves the strategy preset into concrete parameters.
    fn effective_params(&self, request: &QueryRequest) -> SearchParams {
        let mut params = request.params.clone().unwrap_or_default();
        match params.strategy {
            SearchStrategy::Exact => {
                params.exact = true;
                params.hnsw_ef = 0;
            }
            SearchStrategy::Fast => {
                if params.hnsw_ef == 0 {
                    params.hnsw_ef = 40;
                }
            }
            SearchStrategy::Precise => {
                if params.hnsw_ef == 0 {
                    params.hnsw_ef = 300;
                }
            }
            SearchStrategy::Default => {
                if params.hnsw_ef == 0 {
                    params.hnsw_ef = 100;
                }
            }
        }
        params
    }

    fn vector_search(
        &self,
        query: &[f32],
        request: &QueryRequest,
        params: &SearchParams,
        exclude: &[VectorId],
    ) -> Result<QueryResponse> {
        // Over-fetch to survive the offset and exclusions.
        let k = request.limit + request.offset + exclude.len();
        let mut results = self
            .store
            .search(query, k, request.filter.as_ref(), params)?;

        if !exclude.is_empty() {
            results.retain(|r| !exclude.contains(&r.id));
        }

        let results: Vec<SearchResult> = results
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .map(|r| self.strip_vector(r, request.with_vectors))
            .collect();

        Ok(QueryResponse {
            results,
            next_cursor: None,
        })
    }

    /// Mean of positive examples minus mean of negative examples.
    fn recommendation_query(&self, recommend: &RecommendParams) -> Result<Vec<f32>> {
        let dim = self.store.dimensions();
        let positive = self.centroid(&recommend.positive, dim)?;
        let mut query = positive;
        if !recommend.negative.is_empty() {
            let negative = self.centroid(&recommend.negative, dim)?;
            for (q, n) in query.iter_mut().zip(negative.iter()) {
                *q -= n;
            }
        }
        Ok(query)
    }

    fn centroid(&self, ids: &[VectorId], dim: usize) -> Result<Vec<f32>> {
        let mut sum = vec![0.0f32; dim];
        for id in ids {
            let vector = self.store.get(id)?;
            for (s, v) in sum.iter_mut().zip(vector.values.iter()) {
                *s += v;
            }
        }
        let n = ids.len() as f32;
        for s in &mut sum {
            *s /= n;
        }
        Ok(sum)
    }

    fn scroll(&self, scroll: &ScrollParams, request: &QueryRequest) -> Result<QueryResponse> {
        let mut ids = self.store.all_ids();
        ids.sort();

        let start = match &scroll.cursor {
            Some(cursor) => ids.partition_point(|id| id <= cursor),
            None => 0,
        };

        let mut results = Vec::with_capacity(request.limit);
        let mut taken = 0usize;
        let mut last_index = start;
        for (i, id) in ids.iter().enumerate().skip(start) {
            if taken >= request.limit {
                break;
            }
            last_index = i;
            let Ok(vector) = self.store.get(id) else { continue };
            if let Some(filter) = &request.filter {
                if !filter.matches(vector.metadata.as_ref()) {
                    continue;
                }
            }
            taken += 1;
            results.push(self.strip_vector(
                SearchResult {
                    id: id.clone(),
                    distance: 0.0,
                    score: 1.0,
                    vector: Some(vector),
                },
                request.with_vectors,
            ));
        }

        let next_cursor = if last_index + 1 < ids.len() && taken == request.limit {
            results.last().map(|r| r.id.clone())
        } else {
            None
        };

        Ok(QueryResponse {
            results,
            next_cursor,
        })
    }

    fn sample(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let mut ids = self.store.all_ids();

        if let Some(filter) = &request.filter {
            ids.retain(|id| {
                self.store
                    .get(id)
                    .map(|v| filter.matches(v.metadata.as_ref()))
                    .unwrap_or(false)
            });
        }

        let mut rng = rand::thread_rng();
        ids.shuffle(&mut rng);
        ids.truncate(request.limit);

        let results = ids
            .into_iter()
            .filter_map(|id| self.store.get(&id).ok())
            .map(|vector| {
                self.strip_vector(
                    SearchResult {
                        id: vector.id.clone(),
                        distance: 0.0,
                        score: 1.0,
                        vector: Some(vector),
                    },
                    request.with_vectors,
                )
            })
            .collect();

        Ok(QueryResponse {
            results,
            next_cursor: None,
        })
    }

    fn strip_vector(&self, mut result: SearchResult, with_vectors: bool) -> SearchResult {
        if !with_vectors {
            result.vector = None;
        }
        result
    }
}
