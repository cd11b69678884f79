//! Storage governor
//!
//! Two bounded, idempotent, best-effort pruning mechanisms: capacity
//! pruning when the schema outgrows its size target, and real-time pruning
//! driven by skip patterns and stale knowledge groups. Failures here are
//! logged and swallowed; they must never block ingestion or probing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Settings;
use crate::db::features::{delete_features_for_value_types, skip_patterns_above};
use crate::db::knowledge::delete_stale_groups;
use crate::db::settings::max_db_size_gb;
use crate::db::database_size_bytes;
use crate::error::Result;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
/// Bounded slice of vectors removed per skip-pattern pass.
const SKIP_PRUNE_VECTOR_LIMIT: i64 = 1000;
/// Bounded slice of GROUP nodes removed per pass.
const GROUP_PRUNE_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneOutcome {
    pub vectors_deleted: u64,
    pub value_types_deleted: u64,
    pub groups_deleted: u64,
}

// ============================================================================
// Capacity Pruning
// ============================================================================

/// Delete up to `limit` feature vectors in ascending `(usage_count,
/// created_at)` order, never touching a vector referenced by any knowledge
/// node.
async fn capacity_prune_batch(pool: &SqlitePool, limit: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM feature_vectors WHERE vector_id IN (
            SELECT fv.vector_id FROM feature_vectors fv
            LEFT JOIN feature_usage fu ON fu.vector_id = fv.vector_id
            WHERE fv.vector_id NOT IN (
                SELECT vector_1_id FROM knowledge_nodes
                UNION
                SELECT vector_2_id FROM knowledge_nodes WHERE vector_2_id IS NOT NULL
            )
            ORDER BY COALESCE(fu.usage_count, 0) ASC, fv.created_at ASC
            LIMIT ?
        )
    "#,
    )
    .bind(limit)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Compare the schema size against the capacity target (the live
/// `system_settings` value wins over the env default) and shed the
/// least-used vectors when over.
pub async fn ensure_storage_capacity(
    pool: &SqlitePool,
    settings: &Settings,
) -> Result<PruneOutcome> {
    let size = database_size_bytes(pool).await? as f64;
    let cap = max_db_size_gb(pool, settings.max_db_size_gb).await? * BYTES_PER_GB;
    if cap <= 0.0 || size <= cap {
        return Ok(PruneOutcome::default());
    }

    let overshoot = (size - cap) / cap;
    let batch_limit = ((overshoot * 5000.0).ceil() as i64).clamp(500, 5000);
    warn!(
        "database size {:.1} MB exceeds target {:.1} MB, pruning up to {} vectors",
        size / 1e6,
        cap / 1e6,
        batch_limit
    );

    let vectors_deleted = capacity_prune_batch(pool, batch_limit).await?;
    info!("capacity pruning removed {vectors_deleted} feature vector(s)");
    Ok(PruneOutcome {
        vectors_deleted,
        ..PruneOutcome::default()
    })
}

// ============================================================================
// Real-Time Pruning
// ============================================================================

/// Phase 1: value types with heavy skip counts lose a bounded slice of
/// vectors; value types left with no vectors are removed along with their
/// skip rows. Phase 2: stale low-hit GROUP nodes are removed.
pub async fn realtime_prune(pool: &SqlitePool, settings: &Settings) -> Result<PruneOutcome> {
    let mut outcome = PruneOutcome::default();

    let skips = skip_patterns_above(pool, settings.min_skip_count).await?;
    if !skips.is_empty() {
        // Pair each surviving hash with its resolved value type; hashes that
        // never became (or no longer are) value types are ignored.
        let mut targets = Vec::new();
        for skip in &skips {
            if let Some((id, _)) =
                crate::db::features::value_type_for_hash(pool, &skip.descriptor_hash).await?
            {
                targets.push((id, skip.descriptor_hash.clone()));
            }
        }
        let value_types: Vec<i64> = targets.iter().map(|(id, _)| *id).collect();

        outcome.vectors_deleted =
            delete_features_for_value_types(pool, &value_types, SKIP_PRUNE_VECTOR_LIMIT).await?;

        // Value types that became orphans go, cascading their stats; their
        // skip rows go with them.
        for (vt, hash) in &targets {
            let result = sqlx::query(
                "DELETE FROM value_types WHERE value_type_id = ? \
                 AND NOT EXISTS (SELECT 1 FROM feature_vectors WHERE value_type = ?)",
            )
            .bind(vt)
            .bind(vt)
            .execute(pool)
            .await?;
            if result.rows_affected() > 0 {
                outcome.value_types_deleted += result.rows_affected();
                sqlx::query("DELETE FROM skip_patterns WHERE descriptor_hash = ?")
                    .bind(hash)
                    .execute(pool)
                    .await?;
            }
        }
    }

    outcome.groups_deleted = delete_stale_groups(
        pool,
        settings.group_min_age_minutes,
        settings.group_max_hit_count,
        GROUP_PRUNE_LIMIT,
    )
    .await?;

    if outcome.vectors_deleted + outcome.value_types_deleted + outcome.groups_deleted > 0 {
        info!(
            "real-time pruning: {} vector(s), {} value type(s), {} group(s)",
            outcome.vectors_deleted, outcome.value_types_deleted, outcome.groups_deleted
        );
    }
    Ok(outcome)
}

// ============================================================================
// Scheduling
// ============================================================================

/// Rate-limited trigger: real-time pruning runs every N completed ingests
/// and no more often than the configured interval.
pub struct Governor {
    ingest_counter: AtomicU32,
    last_prune: Mutex<Option<Instant>>,
}

impl Default for Governor {
    fn default() -> Self {
        Self::new()
    }
}

impl Governor {
    pub fn new() -> Self {
        Self {
            ingest_counter: AtomicU32::new(0),
            last_prune: Mutex::new(None),
        }
    }

    /// Called after each completed ingest; decides whether this call pays
    /// the pruning cost. Errors are logged, never propagated.
    pub async fn after_ingest(&self, pool: &SqlitePool, settings: &Settings) {
        let count = self.ingest_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if count % settings.prune_every_n_ingests.max(1) != 0 {
            return;
        }
        {
            let mut last = self.last_prune.lock().expect("governor lock poisoned");
            let interval = std::time::Duration::from_millis(settings.prune_min_interval_ms);
            if let Some(at) = *last {
                if at.elapsed() < interval {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        if let Err(e) = realtime_prune(pool, settings).await {
            warn!("real-time pruning failed: {e}");
        }
        if let Err(e) = ensure_storage_capacity(pool, settings).await {
            warn!("capacity check failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::features::{
        insert_feature_batch, record_skip, record_usage, resolve_value_type, NewFeature,
        ValueTypeCache,
    };
    use crate::db::images::create_image;
    use crate::db::init_memory_pool;
    use crate::db::knowledge::upsert_feature_node;
    use crate::db::settings::{set_setting, MAX_DB_SIZE_GB_KEY};
    use crate::sample::descriptor_for_sample;

    async fn seed_features(pool: &SqlitePool, n: usize) -> Vec<i64> {
        let cache = ValueTypeCache::new();
        let img = create_image(pool, "x.png").await.unwrap();
        let d = descriptor_for_sample(1, 3);
        let vt = resolve_value_type(pool, &cache, &d, 4).await.unwrap();
        let batch: Vec<NewFeature> = (0..n)
            .map(|_| NewFeature {
                image_id: img.image_id,
                value_type: vt,
                resolution_level: 80,
                pos_x: 500,
                pos_y: 500,
                rel_x: 1.0,
                rel_y: 0.0,
                value: 0.3,
                size: 0.08,
            })
            .collect();
        insert_feature_batch(pool, &batch).await.unwrap();
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT vector_id FROM feature_vectors ORDER BY vector_id")
                .fetch_all(pool)
                .await
                .unwrap();
        rows.into_iter().map(|(id,)| id).collect()
    }

    #[tokio::test]
    async fn test_capacity_prune_order_and_exclusion() {
        let pool = init_memory_pool().await.unwrap();
        let ids = seed_features(&pool, 6).await;

        // First two vectors gain usage; the third is pinned by knowledge.
        record_usage(&pool, ids[0], None).await.unwrap();
        record_usage(&pool, ids[1], None).await.unwrap();
        upsert_feature_node(&pool, ids[2], 1).await.unwrap();

        // Room for three deletions: the unreferenced zero-usage vectors go
        // first, in creation order.
        let deleted = capacity_prune_batch(&pool, 3).await.unwrap();
        assert_eq!(deleted, 3);

        let remaining: Vec<(i64,)> =
            sqlx::query_as("SELECT vector_id FROM feature_vectors ORDER BY vector_id")
                .fetch_all(&pool)
                .await
                .unwrap();
        let remaining: Vec<i64> = remaining.into_iter().map(|(id,)| id).collect();
        assert!(remaining.contains(&ids[0]));
        assert!(remaining.contains(&ids[1]));
        assert!(remaining.contains(&ids[2]), "referenced vector must survive");
        assert_eq!(remaining.len(), 3);
    }

    #[tokio::test]
    async fn test_ensure_capacity_noop_under_target() {
        let pool = init_memory_pool().await.unwrap();
        seed_features(&pool, 5).await;
        let outcome = ensure_storage_capacity(&pool, &Settings::default())
            .await
            .unwrap();
        assert_eq!(outcome.vectors_deleted, 0);
    }

    #[tokio::test]
    async fn test_ensure_capacity_prunes_over_target() {
        let pool = init_memory_pool().await.unwrap();
        let ids = seed_features(&pool, 10).await;
        upsert_feature_node(&pool, ids[0], 1).await.unwrap();

        // A microscopic target forces an over-capacity pass.
        set_setting(&pool, MAX_DB_SIZE_GB_KEY, "0.000000001")
            .await
            .unwrap();
        let outcome = ensure_storage_capacity(&pool, &Settings::default())
            .await
            .unwrap();
        assert_eq!(outcome.vectors_deleted, 9);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feature_vectors")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_realtime_prune_skip_patterns() {
        let pool = init_memory_pool().await.unwrap();
        seed_features(&pool, 4).await;
        let d = descriptor_for_sample(1, 3);
        for _ in 0..5 {
            record_skip(&pool, &d.hash()).await.unwrap();
        }

        let settings = Settings {
            min_skip_count: 5,
            ..Settings::default()
        };
        let outcome = realtime_prune(&pool, &settings).await.unwrap();
        assert_eq!(outcome.vectors_deleted, 4);
        // All vectors gone, so the value type and its skip row fall too.
        assert_eq!(outcome.value_types_deleted, 1);

        let (skips,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM skip_patterns")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(skips, 0);

        // Idempotent on a clean store.
        let outcome = realtime_prune(&pool, &settings).await.unwrap();
        assert_eq!(outcome.vectors_deleted, 0);
    }

    #[tokio::test]
    async fn test_realtime_prune_below_threshold_is_noop() {
        let pool = init_memory_pool().await.unwrap();
        seed_features(&pool, 4).await;
        let d = descriptor_for_sample(1, 3);
        record_skip(&pool, &d.hash()).await.unwrap();

        let outcome = realtime_prune(&pool, &Settings::default()).await.unwrap();
        assert_eq!(outcome.vectors_deleted, 0);
    }
}
