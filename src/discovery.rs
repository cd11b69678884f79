//! Correlation discoverer
//!
//! Offline learning loop: pick a random feature of a random complete
//! image, find the set of images that feature cannot distinguish, then
//! search the image's other features for the best discriminator of that
//! set. Winners are written to the knowledge graph and folded into the
//! group aggregates. Only appends knowledge and reads completed images,
//! so it co-runs safely with ingestion.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::db::features::{
    ambiguity_features, feature_vec_for_row, features_for_image, random_feature_for_image,
    record_usage, same_key_features_for_images, FeatureRow,
};
use crate::db::images::{count_complete_images, random_complete_image};
use crate::db::knowledge::{bump_group_stat, upsert_feature_node, upsert_group_node};
use crate::error::{EngineError, Result};
use crate::metrics::{
    euclidean_distance, score_candidate_feature, DiscriminatorScore, ScoreLimits,
    RESOLUTION_LEVEL_TOLERANCE,
};
use crate::sample::{ANCHOR_SCALE, OFFSET_TOLERANCE};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub iterations_run: u32,
    pub pairs_written: u32,
    pub empty_ambiguity: u32,
}

/// Soft cancellation checked between iterations.
pub type CancelFlag = AtomicBool;

/// Run up to `iterations` discovery passes. Exits the batch cleanly (with a
/// single log line) when fewer than two complete images exist.
pub async fn run_discovery(
    pool: &SqlitePool,
    settings: &Settings,
    iterations: u32,
    cancel: Option<&CancelFlag>,
) -> Result<DiscoveryReport> {
    let mut report = DiscoveryReport::default();

    if count_complete_images(pool).await? < 2 {
        info!("discovery skipped: fewer than 2 complete images");
        return Ok(report);
    }

    for _ in 0..iterations {
        if cancel.map(|c| c.load(Ordering::Relaxed)).unwrap_or(false) {
            info!("discovery cancelled after {} iteration(s)", report.iterations_run);
            break;
        }
        match discover_once(pool, settings).await {
            Ok(Some(())) => {
                report.iterations_run += 1;
                report.pairs_written += 1;
            }
            Ok(None) => {
                report.iterations_run += 1;
                report.empty_ambiguity += 1;
            }
            Err(EngineError::InsufficientImages) => {
                info!("discovery batch ended: insufficient images");
                break;
            }
            // Discovery failures never block ingestion or probing.
            Err(e) => {
                warn!("discovery iteration failed: {e}");
                report.iterations_run += 1;
            }
        }
    }
    Ok(report)
}

/// One iteration. `Ok(Some(()))` when a pair was written, `Ok(None)` when
/// the drawn feature had nothing to disambiguate.
async fn discover_once(pool: &SqlitePool, settings: &Settings) -> Result<Option<()>> {
    let Some(target_image) = random_complete_image(pool, settings.discovery_min_age_secs).await?
    else {
        return Err(EngineError::InsufficientImages);
    };

    let Some(anchor) = random_feature_for_image(pool, target_image.image_id).await? else {
        return Ok(None);
    };
    record_usage(pool, anchor.vector_id, None).await?;

    // The ambiguity set: images whose same-key measurement sits too close
    // to the anchor for this feature alone to tell apart.
    let anchor_vec = feature_vec_for_row(&anchor);
    let nearby = ambiguity_features(pool, &anchor, RESOLUTION_LEVEL_TOLERANCE, OFFSET_TOLERANCE)
        .await?;
    let mut ambiguous_images: Vec<i64> = nearby
        .iter()
        .filter(|row| {
            euclidean_distance(&anchor_vec, &feature_vec_for_row(row))
                < settings.correlation_similarity_threshold
        })
        .map(|row| row.image_id)
        .collect();
    ambiguous_images.sort_unstable();
    ambiguous_images.dedup();

    if ambiguous_images.is_empty() {
        return Ok(None);
    }

    let limits = ScoreLimits {
        max_candidate_sample: settings.max_candidate_sample,
        min_affinity: settings.min_affinity,
        min_cohesion: settings.min_cohesion,
    };

    // Search the target's other features for the best discriminator of the
    // ambiguity set. Ties break toward higher score, then earlier vector.
    let mut best: Option<(FeatureRow, DiscriminatorScore)> = None;
    for candidate in features_for_image(pool, target_image.image_id).await? {
        if candidate.vector_id == anchor.vector_id {
            continue;
        }
        let population = same_key_features_for_images(
            pool,
            candidate.value_type,
            candidate.pos_x,
            candidate.pos_y,
            &ambiguous_images,
        )
        .await?;
        if population.is_empty() {
            continue;
        }
        let samples: Vec<_> = population.iter().map(feature_vec_for_row).collect();
        let candidate_vec = feature_vec_for_row(&candidate);
        if let Some(score) = score_candidate_feature(&candidate_vec, &samples, &limits) {
            let better = match &best {
                None => true,
                Some((held, held_score)) => {
                    score.score > held_score.score
                        || (score.score == held_score.score && candidate.vector_id < held.vector_id)
                }
            };
            if better {
                best = Some((candidate, score));
            }
        }
    }

    let Some((discriminator, score)) = best else {
        return Ok(None);
    };

    write_pair(pool, &anchor, &discriminator, &score, ambiguous_images.len()).await?;
    debug!(
        "discovered pair: anchor vector {} + discriminator {} (score {:.3})",
        anchor.vector_id, discriminator.vector_id, score.score
    );
    Ok(Some(()))
}

/// Persist an (anchor, discriminator) discovery: both FEATURE nodes, the
/// GROUP node carrying the pair geometry, and the group aggregate.
async fn write_pair(
    pool: &SqlitePool,
    anchor: &FeatureRow,
    discriminator: &FeatureRow,
    score: &DiscriminatorScore,
    original_candidates: usize,
) -> Result<()> {
    let hits = hit_increment(score.sample_size, score.affinity, original_candidates);

    let anchor_node = upsert_feature_node(pool, anchor.vector_id, hits).await?;
    upsert_feature_node(pool, discriminator.vector_id, hits).await?;

    // Pair geometry from the normalized anchor coordinates.
    let du = (discriminator.pos_x - anchor.pos_x) as f64 / ANCHOR_SCALE;
    let dv = (discriminator.pos_y - anchor.pos_y) as f64 / ANCHOR_SCALE;
    let length = (du * du + dv * dv).sqrt();
    let angle = dv.atan2(du);
    let value = discriminator.value - anchor.value;

    upsert_group_node(
        pool,
        anchor_node,
        anchor.vector_id,
        discriminator.vector_id,
        length,
        angle,
        value,
        hits,
    )
    .await?;

    bump_group_stat(
        pool,
        anchor.value_type,
        anchor.resolution_level,
        score.sample_size as i64,
        length,
        angle,
        score.mean_distance,
        score.mean_cosine,
        score.mean_pearson,
    )
    .await?;
    Ok(())
}

/// `max(1, round(n · clamp(affinity, 0.5, 2) / ln(1 + |A|)))`.
fn hit_increment(sample_size: usize, affinity: f64, original_candidates: usize) -> i64 {
    let affinity_factor = affinity.clamp(0.5, 2.0);
    let divisor = (1.0 + original_candidates as f64).ln();
    let raw = (sample_size as f64 * affinity_factor / divisor).round() as i64;
    raw.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::features::{insert_feature_batch, resolve_value_type, NewFeature, ValueTypeCache};
    use crate::db::images::{create_image, mark_ingestion_complete};
    use crate::db::init_memory_pool;
    use crate::db::knowledge::top_group_stats;
    use crate::sample::{descriptor_for_sample, spec_for_descriptor};

    #[test]
    fn test_hit_increment_floor_and_scale() {
        assert_eq!(hit_increment(0, 0.0, 10), 1);
        // 20 * 1.0 / ln(6) ≈ 11.2
        assert_eq!(hit_increment(20, 1.0, 5), 11);
        // Affinity clamps at 2.
        assert_eq!(hit_increment(20, 5.0, 5), 22);
    }

    async fn seed_corpus(pool: &SqlitePool) -> Vec<i64> {
        let cache = ValueTypeCache::new();
        // Two descriptors: one shared (ambiguous), one separating.
        let d_shared = descriptor_for_sample(1, 3);
        let d_split = descriptor_for_sample(2, 3);
        let vt_shared = resolve_value_type(pool, &cache, &d_shared, 4).await.unwrap();
        let vt_split = resolve_value_type(pool, &cache, &d_split, 4).await.unwrap();
        let spec_shared = spec_for_descriptor(&d_shared);
        let spec_split = spec_for_descriptor(&d_split);

        let mut ids = Vec::new();
        for i in 0..3 {
            let img = create_image(pool, &format!("{i}.png")).await.unwrap();
            let features = vec![
                NewFeature {
                    image_id: img.image_id,
                    value_type: vt_shared,
                    resolution_level: spec_shared.resolution_level,
                    pos_x: spec_shared.pos_x,
                    pos_y: spec_shared.pos_y,
                    rel_x: 1.0,
                    rel_y: 0.0,
                    // Nearly identical across images: ambiguous.
                    value: 0.30 + i as f64 * 0.001,
                    size: d_shared.span,
                },
                NewFeature {
                    image_id: img.image_id,
                    value_type: vt_split,
                    resolution_level: spec_split.resolution_level,
                    pos_x: spec_split.pos_x,
                    pos_y: spec_split.pos_y,
                    rel_x: 1.0,
                    rel_y: 0.0,
                    value: 0.30 + i as f64 * 0.002,
                    size: d_split.span,
                },
            ];
            insert_feature_batch(pool, &features).await.unwrap();
            mark_ingestion_complete(pool, img.image_id).await.unwrap();
            ids.push(img.image_id);
        }
        ids
    }

    fn discovery_settings() -> Settings {
        Settings {
            discovery_min_age_secs: 0,
            correlation_similarity_threshold: 0.2,
            min_affinity: 0.0,
            min_cohesion: 0.0,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_insufficient_images_exits_cleanly() {
        let pool = init_memory_pool().await.unwrap();
        let report = run_discovery(&pool, &discovery_settings(), 10, None)
            .await
            .unwrap();
        assert_eq!(report.iterations_run, 0);
        assert_eq!(report.pairs_written, 0);
    }

    #[tokio::test]
    async fn test_discovery_writes_knowledge() {
        let pool = init_memory_pool().await.unwrap();
        seed_corpus(&pool).await;

        let report = run_discovery(&pool, &discovery_settings(), 20, None)
            .await
            .unwrap();
        assert_eq!(report.iterations_run, 20);
        assert!(report.pairs_written > 0);

        let stats = top_group_stats(&pool, 10, 0).await.unwrap();
        assert!(!stats.is_empty());

        let (nodes,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM knowledge_nodes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(nodes >= 2);
    }

    #[tokio::test]
    async fn test_sample_size_monotone_nondecreasing() {
        let pool = init_memory_pool().await.unwrap();
        seed_corpus(&pool).await;
        let settings = discovery_settings();

        let mut last_total = 0i64;
        for _ in 0..5 {
            run_discovery(&pool, &settings, 5, None).await.unwrap();
            let total: i64 = top_group_stats(&pool, 100, 0)
                .await
                .unwrap()
                .iter()
                .map(|s| s.sample_size)
                .sum();
            assert!(total >= last_total, "sample_size shrank: {total} < {last_total}");
            last_total = total;
        }
    }

    #[tokio::test]
    async fn test_cancel_flag_stops_batch() {
        let pool = init_memory_pool().await.unwrap();
        seed_corpus(&pool).await;
        let cancel = CancelFlag::new(true);
        let report = run_discovery(&pool, &discovery_settings(), 50, Some(&cancel))
            .await
            .unwrap();
        assert_eq!(report.iterations_run, 0);
    }
}
