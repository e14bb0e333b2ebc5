//! Distance metric selection and search parameter/result types.

use crate::vector::{Metadata, Vector};
use crate::{LatticeError, VectorId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distance metric for vector similarity computation.
///
/// `Cosine` and `Dot` are similarity metrics (higher is better); `Euclidean`
/// and `Manhattan` are distances (lower is better). The score normalization
/// in the distance kernels maps all four into `[0, 1]` with 1.0 as the best
/// match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Cosine similarity, in `[-1, 1]`; 0 for a zero vector.
    #[default]
    Cosine,
    /// Raw dot product.
    Dot,
    /// Euclidean (L2) distance.
    Euclidean,
    /// Manhattan (L1) distance.
    Manhattan,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Dot => "dot",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::Manhattan => "manhattan",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for DistanceMetric {
    type Err = LatticeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(DistanceMetric::Cosine),
            "dot" => Ok(DistanceMetric::Dot),
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "manhattan" => Ok(DistanceMetric::Manhattan),
            other => Err(LatticeError::UnsupportedMetric(other.to_string())),
        }
    }
}

/// Search strategy presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    /// Balanced defaults.
    #[default]
    Default,
    /// Brute force, bypassing approximate indexes.
    Exact,
    /// Optimize for speed over accuracy.
    Fast,
    /// Optimize for accuracy over speed.
    Precise,
}

/// Controls how a vector search is performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Size of the dynamic candidate list for graph indexes.
    pub hnsw_ef: usize,
    /// Use exact search, bypassing approximate indexes.
    pub exact: bool,
    /// Minimum normalized score for a result to be returned.
    pub score_threshold: Option<f32>,
    /// Strategy preset; adjusts the other knobs when processed.
    pub strategy: SearchStrategy,
    /// Search deadline in milliseconds; expiry is observed between
    /// candidate batches and yields the results collected so far.
    pub timeout_ms: Option<u64>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            hnsw_ef: 100,
            exact: false,
            score_threshold: None,
            strategy: SearchStrategy::Default,
            timeout_ms: None,
        }
    }
}

impl SearchParams {
    /// Parameters optimized for speed.
    pub fn fast() -> Self {
        Self {
            hnsw_ef: 40,
            strategy: SearchStrategy::Fast,
            ..Default::default()
        }
    }

    /// Parameters optimized for accuracy.
    pub fn precise() -> Self {
        Self {
            hnsw_ef: 300,
            strategy: SearchStrategy::Precise,
            ..Default::default()
        }
    }

    /// Sets the score threshold.
    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    /// Sets the search deadline in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A single search result.
///
/// Results are ordered best-first: ascending raw value for distance metrics,
/// descending for similarity metrics; ties broken by lexicographic id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Matched vector id.
    pub id: VectorId,
    /// Raw metric value.
    pub distance: f32,
    /// Normalized score in `[0, 1]`, 1.0 best.
    pub score: f32,
    /// Vector data, present unless stripped by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vector>,
}

impl SearchResult {
    /// Returns the result's metadata, if the vector payload is present.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.vector.as_ref().and_then(|v| v.metadata.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_parse_roundtrip() {
        for metric in [
            DistanceMetric::Cosine,
            DistanceMetric::Dot,
            DistanceMetric::Euclidean,
            DistanceMetric::Manhattan,
        ] {
            let parsed: DistanceMetric = metric.to_string().parse().unwrap();
            assert_eq!(parsed, metric);
        }
    }

    #[test]
    fn test_metric_parse_rejects_unknown() {
        let err = "hamming".parse::<DistanceMetric>().unwrap_err();
        assert!(matches!(err, LatticeError::UnsupportedMetric(_)));
    }

    #[test]
    fn test_metric_serde_lowercase() {
        let json = serde_json::to_string(&DistanceMetric::Euclidean).unwrap();
        assert_eq!(json, "\"euclidean\"");
    }

    #[test]
    fn test_search_params_presets() {
        assert_eq!(SearchParams::default().hnsw_ef, 100);
        assert_eq!(SearchParams::fast().hnsw_ef, 40);
        assert_eq!(SearchParams::precise().hnsw_ef, 300);
    }

    #[test]
    fn test_search_params_deserialize_partial() {
        let params: SearchParams = serde_json::from_str(r#"{"score_threshold": 0.5}"#).unwrap();
        assert_eq!(params.score_threshold, Some(0.5));
        assert_eq!(params.hnsw_ef, 100);
    }
}
