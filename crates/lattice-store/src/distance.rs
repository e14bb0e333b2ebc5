//! Distance kernels and score normalization.
//!
//! Raw metric semantics and the `[0, 1]` score mapping:
//!
//! | Metric    | Raw value            | Better | Score             |
//! |-----------|----------------------|--------|-------------------|
//! | Cosine    | `dot/(‖a‖·‖b‖)`      | higher | `(sim + 1) / 2`   |
//! | Dot       | `Σ aᵢ·bᵢ`            | higher | clamp to `[0, 1]` |
//! | Euclidean | `√Σ (aᵢ−bᵢ)²`        | lower  | `exp(−d)`         |
//! | Manhattan | `Σ \|aᵢ−bᵢ\|`        | lower  | `exp(−0.5·d)`     |
//!
//! Dimension mismatch yields a sentinel (−1 for similarities, +∞ for
//! distances); callers must treat it as "not a neighbor". Comparing a zero
//! vector under cosine yields similarity 0.

use lattice_core::DistanceMetric;

/// A distance kernel: query and candidate to raw metric value.
pub type DistanceFn = fn(&[f32], &[f32]) -> f32;

/// Returns the kernel for a metric.
pub fn distance_fn(metric: DistanceMetric) -> DistanceFn {
    match metric {
        DistanceMetric::Cosine => cosine_similarity,
        DistanceMetric::Dot => dot_product,
        DistanceMetric::Euclidean => euclidean_distance,
        DistanceMetric::Manhattan => manhattan_distance,
    }
}

/// Cosine similarity in `[-1, 1]`; −1 on dimension mismatch, 0 if either
/// vector is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return -1.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Dot product; −1 on dimension mismatch (similarity-family sentinel).
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return -1.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Euclidean (L2) distance; +∞ on dimension mismatch.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Manhattan (L1) distance; +∞ on dimension mismatch.
pub fn manhattan_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

/// L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Normalizes a vector in place to unit length; zero vectors are unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm == 0.0 {
        return;
    }
    for x in v {
        *x /= norm;
    }
}

/// Precomputes L2 norms for a batch of vectors.
///
/// Pairing this with [`cosine_similarity_with_norms`] reduces per-query
/// cosine work to a single inner product over the owned set.
pub fn precompute_norms(vectors: &[Vec<f32>]) -> Vec<f32> {
    vectors.iter().map(|v| l2_norm(v)).collect()
}

/// Cosine similarity using precomputed norms.
pub fn cosine_similarity_with_norms(a: &[f32], b: &[f32], norm_a: f32, norm_b: f32) -> f32 {
    if a.len() != b.len() {
        return -1.0;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (norm_a * norm_b)
}

/// Computes the metric between one query and many vectors.
pub fn batch_distance(query: &[f32], vectors: &[Vec<f32>], metric: DistanceMetric) -> Vec<f32> {
    let f = distance_fn(metric);
    vectors.iter().map(|v| f(query, v)).collect()
}

/// Returns true if a higher raw value means a better match.
pub fn higher_is_better(metric: DistanceMetric) -> bool {
    match metric {
        DistanceMetric::Cosine | DistanceMetric::Dot => true,
        DistanceMetric::Euclidean | DistanceMetric::Manhattan => false,
    }
}

/// Maps a raw metric value to a normalized score in `[0, 1]`, 1.0 best.
pub fn normalize_score(raw: f32, metric: DistanceMetric) -> f32 {
    match metric {
        DistanceMetric::Cosine => (raw + 1.0) / 2.0,
        DistanceMetric::Dot => raw.clamp(0.0, 1.0),
        DistanceMetric::Euclidean => (-raw).exp(),
        DistanceMetric::Manhattan => (-0.5 * raw).exp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let a = [1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = [1.0, 0.0];
        let b = [-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector_convention() {
        let zero = [0.0, 0.0];
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
        assert_eq!(cosine_similarity(&zero, &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_dimension_mismatch_sentinels() {
        let a = [1.0, 2.0];
        let b = [1.0, 2.0, 3.0];
        assert_eq!(cosine_similarity(&a, &b), -1.0);
        assert_eq!(dot_product(&a, &b), -1.0);
        assert_eq!(euclidean_distance(&a, &b), f32::INFINITY);
        assert_eq!(manhattan_distance(&a, &b), f32::INFINITY);
    }

    #[test]
    fn test_euclidean() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];
        assert!((euclidean_distance(&a, &b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_manhattan() {
        let a = [1.0, 2.0];
        let b = [4.0, -2.0];
        assert!((manhattan_distance(&a, &b) - 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize() {
        let mut v = [3.0, 4.0];
        normalize(&mut v);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);

        let mut zero = [0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, [0.0, 0.0]);
    }

    #[test]
    fn test_norms_path_matches_direct() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![4.0, 5.0, 6.0];
        let norms = precompute_norms(&[a.clone(), b.clone()]);
        let with_norms = cosine_similarity_with_norms(&a, &b, norms[0], norms[1]);
        let direct = cosine_similarity(&a, &b);
        assert!((with_norms - direct).abs() < 1e-6);
    }

    #[test]
    fn test_batch_distance() {
        let query = [1.0, 0.0];
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let sims = batch_distance(&query, &vectors, DistanceMetric::Cosine);
        assert!((sims[0] - 1.0).abs() < 1e-6);
        assert!(sims[1].abs() < 1e-6);
    }

    #[test]
    fn test_score_ranges() {
        // Cosine maps [-1, 1] into [0, 1].
        assert_eq!(normalize_score(1.0, DistanceMetric::Cosine), 1.0);
        assert_eq!(normalize_score(-1.0, DistanceMetric::Cosine), 0.0);
        assert_eq!(normalize_score(0.0, DistanceMetric::Cosine), 0.5);

        // Dot clamps.
        assert_eq!(normalize_score(3.5, DistanceMetric::Dot), 1.0);
        assert_eq!(normalize_score(-2.0, DistanceMetric::Dot), 0.0);

        // Distances decay into (0, 1].
        assert_eq!(normalize_score(0.0, DistanceMetric::Euclidean), 1.0);
        let far = normalize_score(10.0, DistanceMetric::Euclidean);
        assert!(far > 0.0 && far < 0.001);
        assert!(normalize_score(2.0, DistanceMetric::Manhattan) > 0.0);
        assert!(normalize_score(2.0, DistanceMetric::Manhattan) <= 1.0);
    }

    #[test]
    fn test_higher_is_better() {
        assert!(higher_is_better(DistanceMetric::Cosine));
        assert!(higher_is_better(DistanceMetric::Dot));
        assert!(!higher_is_better(DistanceMetric::Euclidean));
        assert!(!higher_is_better(DistanceMetric::Manhattan));
    }
}
