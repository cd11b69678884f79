//! Correlation metrics
//!
//! Every stored feature reduces to the 4-vector `(value, rel_x, rel_y,
//! size)`. Distances across different value types or mismatched resolution
//! levels are infinite, which keeps keyed populations comparable. The
//! discriminator score is the universal "is this a good discriminator?"
//! signal shared by the matcher and correlation discovery.

use serde::{Deserialize, Serialize};

/// Resolution levels may drift by this much and still compare.
pub const RESOLUTION_LEVEL_TOLERANCE: i64 = 2;

/// A feature projected to its comparable form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVec {
    pub value_type: i64,
    pub resolution_level: i64,
    pub value: f64,
    pub rel_x: f64,
    pub rel_y: f64,
    pub size: f64,
}

impl FeatureVec {
    pub fn components(&self) -> [f64; 4] {
        [self.value, self.rel_x, self.rel_y, self.size]
    }
}

/// 4-D Euclidean distance; infinite across value types or when resolution
/// levels diverge beyond tolerance.
pub fn euclidean_distance(a: &FeatureVec, b: &FeatureVec) -> f64 {
    if a.value_type != b.value_type
        || (a.resolution_level - b.resolution_level).abs() > RESOLUTION_LEVEL_TOLERANCE
    {
        return f64::INFINITY;
    }
    let (ca, cb) = (a.components(), b.components());
    ca.iter()
        .zip(cb.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

pub fn cosine_similarity(a: &FeatureVec, b: &FeatureVec) -> f64 {
    let (ca, cb) = (a.components(), b.components());
    let dot: f64 = ca.iter().zip(cb.iter()).map(|(x, y)| x * y).sum();
    let na: f64 = ca.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb: f64 = cb.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na <= f64::EPSILON || nb <= f64::EPSILON {
        return 0.0;
    }
    (dot / (na * nb)).clamp(-1.0, 1.0)
}

pub fn pearson_correlation(a: &FeatureVec, b: &FeatureVec) -> f64 {
    let (ca, cb) = (a.components(), b.components());
    let n = ca.len() as f64;
    let mean_a: f64 = ca.iter().sum::<f64>() / n;
    let mean_b: f64 = cb.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in ca.iter().zip(cb.iter()) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a) * (x - mean_a);
        var_b += (y - mean_b) * (y - mean_b);
    }
    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return 0.0;
    }
    (cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0)
}

// ============================================================================
// Discriminator Scoring
// ============================================================================

/// Acceptance floors and truncation for discriminator scoring.
#[derive(Debug, Clone, Copy)]
pub struct ScoreLimits {
    pub max_candidate_sample: usize,
    pub min_affinity: f64,
    pub min_cohesion: f64,
}

/// Score plus the component metrics that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorScore {
    pub score: f64,
    pub affinity: f64,
    pub cohesion: f64,
    pub density: f64,
    pub stability: f64,
    pub mean_distance: f64,
    pub mean_cosine: f64,
    pub mean_pearson: f64,
    pub sample_size: usize,
}

/// Evaluate how well `target` separates the sample population. Samples with
/// infinite distance (foreign value type) are excluded up front; the rest
/// are truncated to `max_candidate_sample`. Returns `None` when the
/// population is empty or the affinity/cohesion floors reject the pair.
pub fn score_candidate_feature(
    target: &FeatureVec,
    samples: &[FeatureVec],
    limits: &ScoreLimits,
) -> Option<DiscriminatorScore> {
    let comparable: Vec<&FeatureVec> = samples
        .iter()
        .filter(|s| euclidean_distance(target, s).is_finite())
        .take(limits.max_candidate_sample)
        .collect();
    if comparable.is_empty() {
        return None;
    }
    let n = comparable.len() as f64;

    let distances: Vec<f64> = comparable
        .iter()
        .map(|s| euclidean_distance(target, s))
        .collect();
    let mean_distance = distances.iter().sum::<f64>() / n;
    let var_distance = distances
        .iter()
        .map(|d| (d - mean_distance) * (d - mean_distance))
        .sum::<f64>()
        / n;
    let std_distance = var_distance.max(0.0).sqrt();

    let mean_cosine = comparable
        .iter()
        .map(|s| cosine_similarity(target, s))
        .sum::<f64>()
        / n;
    let mean_pearson = comparable
        .iter()
        .map(|s| pearson_correlation(target, s))
        .sum::<f64>()
        / n;

    let affinity = (((mean_cosine + 1.0) / 2.0 + (mean_pearson + 1.0) / 2.0) / 2.0).clamp(0.0, 1.0);
    let density = (1.0 / (1.0 + mean_distance)).clamp(0.0, 1.0);
    let stability = (1.0 / (1.0 + std_distance)).clamp(0.0, 1.0);
    let cohesion = ((density + stability) / 2.0).clamp(0.0, 1.0);

    if affinity < limits.min_affinity || cohesion < limits.min_cohesion {
        return None;
    }

    let score = affinity * cohesion * (1.0 + (1.0 + n).ln());
    Some(DiscriminatorScore {
        score,
        affinity,
        cohesion,
        density,
        stability,
        mean_distance,
        mean_cosine,
        mean_pearson,
        sample_size: comparable.len(),
    })
}
