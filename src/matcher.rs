//! Candidate matcher
//!
//! Keyed lookup of stored features against a probe, with elastic threshold
//! relaxation and per-image scoring. The integer key must match exactly;
//! relative offsets match within the wire tolerance; the 4-D distance gate
//! is the only part that relaxes.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use crate::config::Settings;
use crate::db::features::{feature_vec_for_row, value_type_for_hash, FeatureRow};
use crate::descriptor::Descriptor;
use crate::error::{EngineError, Result};
use crate::metrics::{euclidean_distance, score_candidate_feature, FeatureVec, ScoreLimits};
use crate::sample::{quantize_anchor, resolution_level_for_span, OFFSET_TOLERANCE};

// ============================================================================
// Wire Probe
// ============================================================================

/// A probe as received on the wire: the full descriptor record plus the
/// measured payload. Integer lookup keys are re-derived server-side from
/// the quantization constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    pub descriptor: Descriptor,
    pub value: f64,
    pub size: f64,
    pub rel_x: f64,
    pub rel_y: f64,
    /// Optional client echo; must agree with the re-derived level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_level: Option<i64>,
}

/// Reject malformed probes before touching the store. An explicit
/// `resolution_level` that disagrees with `round(size · SPAN_SCALE)` is a
/// legacy encoding and is refused here.
pub fn validate_probe(probe: &Probe) -> Result<()> {
    if probe.descriptor.family != crate::descriptor::FAMILY_DELTA {
        return Err(EngineError::MalformedDescriptor(format!(
            "unsupported family: {}",
            probe.descriptor.family
        )));
    }
    if !(probe.size > 0.0 && probe.size <= 1.0) {
        return Err(EngineError::MalformedDescriptor(format!(
            "size out of range: {}",
            probe.size
        )));
    }
    if !probe.value.is_finite() || !probe.rel_x.is_finite() || !probe.rel_y.is_finite() {
        return Err(EngineError::MalformedDescriptor("non-finite payload".into()));
    }
    let derived = resolution_level_for_span(probe.size);
    if let Some(level) = probe.resolution_level {
        if level != derived {
            return Err(EngineError::MalformedDescriptor(format!(
                "resolution_level {level} does not match derived {derived}"
            )));
        }
    }
    Ok(())
}

/// A probe resolved to its integer lookup key.
#[derive(Debug, Clone)]
pub struct ResolvedProbe {
    pub descriptor_hash: String,
    pub value_type: i64,
    pub resolution_level: i64,
    pub pos_x: i64,
    pub pos_y: i64,
    pub rel_x: f64,
    pub rel_y: f64,
    pub value: f64,
    pub size: f64,
}

impl ResolvedProbe {
    pub fn feature_vec(&self) -> FeatureVec {
        FeatureVec {
            value_type: self.value_type,
            resolution_level: self.resolution_level,
            value: self.value,
            rel_x: self.rel_x,
            rel_y: self.rel_y,
            size: self.size,
        }
    }
}

/// Resolve the probe's descriptor against the store. `None` when the
/// descriptor hash has never been ingested (no candidates possible).
pub async fn resolve_probe(pool: &SqlitePool, probe: &Probe) -> Result<Option<ResolvedProbe>> {
    validate_probe(probe)?;
    let canonical = probe.descriptor.canonicalize();
    let hash = canonical.hash();

    let Some((value_type, _)) = value_type_for_hash(pool, &hash).await? else {
        return Ok(None);
    };

    Ok(Some(ResolvedProbe {
        descriptor_hash: hash,
        value_type,
        resolution_level: resolution_level_for_span(probe.size),
        pos_x: quantize_anchor(canonical.anchor_u),
        pos_y: quantize_anchor(canonical.anchor_v),
        rel_x: probe.rel_x,
        rel_y: probe.rel_y,
        value: probe.value,
        size: probe.size,
    }))
}

// ============================================================================
// Candidate Lookup
// ============================================================================

/// One image that matched a probe, with its score and best feature.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub image_id: i64,
    pub score: f64,
    pub best_distance: f64,
    pub best_vector_id: i64,
}

/// The full result of an elastic lookup.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    pub candidates: Vec<ScoredCandidate>,
    pub threshold_used: f64,
    pub relax_steps: u32,
}

impl CandidateSet {
    pub fn image_ids(&self) -> Vec<i64> {
        self.candidates.iter().map(|c| c.image_id).collect()
    }
}

async fn key_rows(pool: &SqlitePool, probe: &ResolvedProbe) -> Result<Vec<FeatureRow>> {
    let rows = sqlx::query_as::<_, FeatureRow>(
        r#"
        SELECT * FROM feature_vectors
        WHERE value_type = ? AND resolution_level = ? AND pos_x = ? AND pos_y = ?
          AND ABS(rel_x - ?) <= ? AND ABS(rel_y - ?) <= ?
    "#,
    )
    .bind(probe.value_type)
    .bind(probe.resolution_level)
    .bind(probe.pos_x)
    .bind(probe.pos_y)
    .bind(probe.rel_x)
    .bind(OFFSET_TOLERANCE)
    .bind(probe.rel_y)
    .bind(OFFSET_TOLERANCE)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Group key-matching rows by image at one distance threshold.
fn group_within(
    probe_vec: &FeatureVec,
    rows: &[FeatureRow],
    threshold: f64,
    limits: &ScoreLimits,
) -> Vec<ScoredCandidate> {
    use std::collections::HashMap;

    let mut per_image: HashMap<i64, Vec<(f64, FeatureRow)>> = HashMap::new();
    for row in rows {
        let d = euclidean_distance(probe_vec, &feature_vec_for_row(row));
        if d <= threshold {
            per_image.entry(row.image_id).or_default().push((d, row.clone()));
        }
    }

    let mut out: Vec<ScoredCandidate> = per_image
        .into_iter()
        .map(|(image_id, matches)| {
            let samples: Vec<FeatureVec> =
                matches.iter().map(|(_, r)| feature_vec_for_row(r)).collect();
            let score = score_candidate_feature(probe_vec, &samples, limits)
                .map(|s| s.score)
                .unwrap_or(0.0);
            let (best_distance, best_row) = matches
                .iter()
                .min_by(|a, b| a.0.total_cmp(&b.0))
                .expect("group is non-empty")
                .clone();
            ScoredCandidate {
                image_id,
                score,
                best_distance,
                best_vector_id: best_row.vector_id,
            }
        })
        .collect();

    out.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.best_distance.total_cmp(&b.best_distance))
            .then(a.image_id.cmp(&b.image_id))
    });
    out
}

/// Keyed lookup with elastic relaxation: while fewer than `min_unique`
/// distinct images match, widen the distance threshold by the relax factor,
/// up to the step cap. An empty keyed row set returns an empty grouping
/// immediately.
pub async fn find_candidates(
    pool: &SqlitePool,
    probe: &ResolvedProbe,
    settings: &Settings,
) -> Result<CandidateSet> {
    let rows = key_rows(pool, probe).await?;
    let probe_vec = probe.feature_vec();
    let limits = ScoreLimits {
        max_candidate_sample: settings.max_candidate_sample,
        min_affinity: settings.min_affinity,
        min_cohesion: settings.min_cohesion,
    };

    let mut threshold = settings.value_threshold;
    let mut steps = 0u32;
    loop {
        let candidates = group_within(&probe_vec, &rows, threshold, &limits);
        if rows.is_empty()
            || candidates.len() >= settings.min_unique
            || steps >= settings.relax_max_steps
        {
            if steps > 0 {
                debug!(
                    "elastic lookup relaxed {} step(s) to threshold {:.4}",
                    steps, threshold
                );
            }
            return Ok(CandidateSet {
                candidates,
                threshold_used: threshold,
                relax_steps: steps,
            });
        }
        threshold *= settings.relax_factor;
        steps += 1;
    }
}

/// Strict (non-elastic) lookup used by session refinement, where widening
/// the net would fight the intersection.
pub async fn find_candidates_strict(
    pool: &SqlitePool,
    probe: &ResolvedProbe,
    settings: &Settings,
) -> Result<CandidateSet> {
    let strict = Settings {
        relax_max_steps: 0,
        ..settings.clone()
    };
    find_candidates(pool, probe, &strict).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::features::{insert_feature_batch, resolve_value_type, NewFeature, ValueTypeCache};
    use crate::db::images::create_image;
    use crate::db::init_memory_pool;
    use crate::sample::{descriptor_for_sample, spec_for_descriptor};

    fn probe_for(d: &Descriptor, value: f64) -> Probe {
        Probe {
            descriptor: d.clone(),
            value,
            size: d.span,
            rel_x: 1.0,
            rel_y: 0.0,
            resolution_level: None,
        }
    }

    async fn seed(pool: &SqlitePool, d: &Descriptor, values: &[(i64, f64)]) -> i64 {
        let cache = ValueTypeCache::new();
        let vt = resolve_value_type(pool, &cache, d, 4).await.unwrap();
        let spec = spec_for_descriptor(d);
        let batch: Vec<NewFeature> = values
            .iter()
            .map(|(image_id, value)| NewFeature {
                image_id: *image_id,
                value_type: vt,
                resolution_level: spec.resolution_level,
                pos_x: spec.pos_x,
                pos_y: spec.pos_y,
                rel_x: 1.0,
                rel_y: 0.0,
                value: *value,
                size: d.span,
            })
            .collect();
        insert_feature_batch(pool, &batch).await.unwrap();
        vt
    }

    #[tokio::test]
    async fn test_unknown_descriptor_resolves_none() {
        let pool = init_memory_pool().await.unwrap();
        let d = descriptor_for_sample(3, 3);
        assert!(resolve_probe(&pool, &probe_for(&d, 0.5))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_validation_rejects_legacy_level() {
        let d = descriptor_for_sample(3, 3);
        let mut p = probe_for(&d, 0.5);
        p.resolution_level = Some(resolution_level_for_span(p.size));
        assert!(validate_probe(&p).is_ok());

        p.resolution_level = Some(7); // gridSize-era encoding
        assert!(matches!(
            validate_probe(&p),
            Err(EngineError::MalformedDescriptor(_))
        ));

        let mut bad_family = probe_for(&d, 0.5);
        bad_family.descriptor.family = "grid".into();
        assert!(validate_probe(&bad_family).is_err());
    }

    #[tokio::test]
    async fn test_exact_match_single_image() {
        let pool = init_memory_pool().await.unwrap();
        let settings = Settings::default();
        let img = create_image(&pool, "x.png").await.unwrap();
        let d = descriptor_for_sample(3, 3);
        seed(&pool, &d, &[(img.image_id, 0.42)]).await;

        let resolved = resolve_probe(&pool, &probe_for(&d, 0.42))
            .await
            .unwrap()
            .unwrap();
        let set = find_candidates(&pool, &resolved, &settings).await.unwrap();
        assert_eq!(set.image_ids(), vec![img.image_id]);
    }

    #[tokio::test]
    async fn test_threshold_excludes_distant_values() {
        let pool = init_memory_pool().await.unwrap();
        let settings = Settings {
            relax_max_steps: 0,
            ..Settings::default()
        };
        let a = create_image(&pool, "a.png").await.unwrap();
        let b = create_image(&pool, "b.png").await.unwrap();
        let d = descriptor_for_sample(3, 3);
        seed(&pool, &d, &[(a.image_id, 0.40), (b.image_id, 0.90)]).await;

        let resolved = resolve_probe(&pool, &probe_for(&d, 0.41))
            .await
            .unwrap()
            .unwrap();
        let set = find_candidates(&pool, &resolved, &settings).await.unwrap();
        assert_eq!(set.image_ids(), vec![a.image_id]);
    }

    #[tokio::test]
    async fn test_elastic_relaxation_finds_second_image() {
        let pool = init_memory_pool().await.unwrap();
        let settings = Settings {
            value_threshold: 0.05,
            relax_factor: 2.0,
            relax_max_steps: 3,
            min_unique: 2,
            ..Settings::default()
        };
        let a = create_image(&pool, "a.png").await.unwrap();
        let b = create_image(&pool, "b.png").await.unwrap();
        let d = descriptor_for_sample(3, 3);
        // Second value sits outside the base threshold but inside 0.05*2^2.
        seed(&pool, &d, &[(a.image_id, 0.40), (b.image_id, 0.55)]).await;

        let resolved = resolve_probe(&pool, &probe_for(&d, 0.40))
            .await
            .unwrap()
            .unwrap();
        let set = find_candidates(&pool, &resolved, &settings).await.unwrap();
        assert_eq!(set.candidates.len(), 2);
        assert!(set.relax_steps > 0);
    }

    #[tokio::test]
    async fn test_empty_rows_no_loop() {
        let pool = init_memory_pool().await.unwrap();
        let settings = Settings::default();
        let d = descriptor_for_sample(3, 3);
        // Value type exists but no features were stored.
        let cache = ValueTypeCache::new();
        resolve_value_type(&pool, &cache, &d, 4).await.unwrap();

        let resolved = resolve_probe(&pool, &probe_for(&d, 0.5))
            .await
            .unwrap()
            .unwrap();
        let set = find_candidates(&pool, &resolved, &settings).await.unwrap();
        assert!(set.candidates.is_empty());
        assert_eq!(set.relax_steps, 0);
    }
}
