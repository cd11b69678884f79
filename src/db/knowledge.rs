//! Knowledge graph storage
//!
//! Discovered descriptor relationships live in an arena of rows with
//! integer parent references; traversal happens by joining in the
//! database, never through in-process pointers. FEATURE nodes wrap a
//! single vector; GROUP nodes wrap an ordered (anchor, discriminator)
//! pair with precomputed geometry. `feature_group_stats` aggregates
//! incrementally-weighted moments per `(value_type, resolution_level)`.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::descriptor::Descriptor;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Feature,
    Group,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Feature => "FEATURE",
            NodeType::Group => "GROUP",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct KnowledgeNodeRow {
    pub node_id: i64,
    pub parent_node_id: Option<i64>,
    pub node_type: String,
    pub vector_1_id: i64,
    pub vector_2_id: Option<i64>,
    pub vector_length: f64,
    pub vector_angle: f64,
    pub vector_value: f64,
    pub hit_count: i64,
    pub miss_count: i64,
    pub created_at: i64,
}

// ============================================================================
// Node Upserts
// ============================================================================

/// Find-or-create the FEATURE node wrapping a vector, bumping its hit
/// count. The unique tuple contains a NULL `vector_2_id`, which SQLite
/// treats as distinct, so the lookup is explicit rather than ON CONFLICT.
pub async fn upsert_feature_node(
    pool: &SqlitePool,
    vector_id: i64,
    hit_increment: i64,
) -> Result<i64> {
    let existing = sqlx::query_as::<_, (i64,)>(
        "SELECT node_id FROM knowledge_nodes \
         WHERE node_type = ? AND vector_1_id = ? AND vector_2_id IS NULL",
    )
    .bind(NodeType::Feature.as_str())
    .bind(vector_id)
    .fetch_optional(pool)
    .await?;

    if let Some((node_id,)) = existing {
        sqlx::query("UPDATE knowledge_nodes SET hit_count = hit_count + ? WHERE node_id = ?")
            .bind(hit_increment)
            .bind(node_id)
            .execute(pool)
            .await?;
        return Ok(node_id);
    }

    let result = sqlx::query(
        "INSERT INTO knowledge_nodes \
         (node_type, vector_1_id, vector_length, vector_angle, vector_value, hit_count, created_at) \
         VALUES (?, ?, 0, 0, 0, ?, ?)",
    )
    .bind(NodeType::Feature.as_str())
    .bind(vector_id)
    .bind(hit_increment)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Find-or-create a GROUP node for an (anchor, discriminator) pair with its
/// precomputed geometry, bumping its hit count.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_group_node(
    pool: &SqlitePool,
    parent_node_id: i64,
    vector_1_id: i64,
    vector_2_id: i64,
    length: f64,
    angle: f64,
    value: f64,
    hit_increment: i64,
) -> Result<i64> {
    let existing = sqlx::query_as::<_, (i64,)>(
        "SELECT node_id FROM knowledge_nodes \
         WHERE node_type = ? AND vector_1_id = ? AND vector_2_id = ? \
           AND vector_length = ? AND vector_angle = ?",
    )
    .bind(NodeType::Group.as_str())
    .bind(vector_1_id)
    .bind(vector_2_id)
    .bind(length)
    .bind(angle)
    .fetch_optional(pool)
    .await?;

    if let Some((node_id,)) = existing {
        sqlx::query("UPDATE knowledge_nodes SET hit_count = hit_count + ? WHERE node_id = ?")
            .bind(hit_increment)
            .bind(node_id)
            .execute(pool)
            .await?;
        return Ok(node_id);
    }

    let result = sqlx::query(
        "INSERT INTO knowledge_nodes \
         (parent_node_id, node_type, vector_1_id, vector_2_id, vector_length, vector_angle, \
          vector_value, hit_count, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(parent_node_id)
    .bind(NodeType::Group.as_str())
    .bind(vector_1_id)
    .bind(vector_2_id)
    .bind(length)
    .bind(angle)
    .bind(value)
    .bind(hit_increment)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Count one failed knowledge-guided probe against a node.
pub async fn record_node_miss(pool: &SqlitePool, node_id: i64) -> Result<()> {
    sqlx::query("UPDATE knowledge_nodes SET miss_count = miss_count + 1 WHERE node_id = ?")
        .bind(node_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Group Stats
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FeatureGroupStat {
    pub stat_id: i64,
    pub value_type: i64,
    pub resolution_level: i64,
    pub sample_size: i64,
    pub mean_length: f64,
    pub mean_angle: f64,
    pub mean_distance: f64,
    pub mean_cosine: f64,
    pub mean_pearson: f64,
    pub updated_at: i64,
}

/// Fold one discovered pair batch into the aggregate. SQLite evaluates
/// every SET expression against the pre-update row, so the weighted means
/// use the old `sample_size` regardless of assignment order.
#[allow(clippy::too_many_arguments)]
pub async fn bump_group_stat(
    pool: &SqlitePool,
    value_type: i64,
    resolution_level: i64,
    sample_size: i64,
    length: f64,
    angle: f64,
    distance: f64,
    cosine: f64,
    pearson: f64,
) -> Result<()> {
    if sample_size <= 0 {
        return Err(EngineError::other("group stat batch must be non-empty"));
    }
    sqlx::query(
        r#"
        INSERT INTO feature_group_stats
            (value_type, resolution_level, sample_size, mean_length, mean_angle,
             mean_distance, mean_cosine, mean_pearson, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (value_type, resolution_level) DO UPDATE SET
            mean_length = (mean_length * sample_size + excluded.mean_length * excluded.sample_size)
                          / (sample_size + excluded.sample_size),
            mean_angle = (mean_angle * sample_size + excluded.mean_angle * excluded.sample_size)
                         / (sample_size + excluded.sample_size),
            mean_distance = (mean_distance * sample_size + excluded.mean_distance * excluded.sample_size)
                            / (sample_size + excluded.sample_size),
            mean_cosine = (mean_cosine * sample_size + excluded.mean_cosine * excluded.sample_size)
                          / (sample_size + excluded.sample_size),
            mean_pearson = (mean_pearson * sample_size + excluded.mean_pearson * excluded.sample_size)
                           / (sample_size + excluded.sample_size),
            sample_size = sample_size + excluded.sample_size,
            updated_at = excluded.updated_at
    "#,
    )
    .bind(value_type)
    .bind(resolution_level)
    .bind(sample_size)
    .bind(length)
    .bind(angle)
    .bind(distance)
    .bind(cosine)
    .bind(pearson)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

/// Most-sampled group stats, the selector's raw material.
pub async fn top_group_stats(
    pool: &SqlitePool,
    limit: i64,
    min_sample_size: i64,
) -> Result<Vec<FeatureGroupStat>> {
    let rows = sqlx::query_as::<_, FeatureGroupStat>(
        "SELECT * FROM feature_group_stats WHERE sample_size >= ? \
         ORDER BY sample_size DESC LIMIT ?",
    )
    .bind(min_sample_size)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ============================================================================
// Related Constellations
// ============================================================================

/// One GROUP-node companion of an anchor value type, hydrated with the
/// related descriptor.
#[derive(Debug, Clone)]
pub struct RelatedConstellation {
    pub node_id: i64,
    pub related_value_type: i64,
    pub descriptor_hash: String,
    pub descriptor: Descriptor,
    pub hit_count: i64,
    pub miss_count: i64,
    pub success_rate: f64,
}

#[derive(Debug, FromRow)]
struct RelatedRow {
    node_id: i64,
    related_value_type: i64,
    descriptor_hash: String,
    descriptor_json: String,
    hit_count: i64,
    miss_count: i64,
}

/// GROUP companions of the given anchor value type, best-first by
/// `hits/(hits+misses)`.
pub async fn related_constellations(
    pool: &SqlitePool,
    anchor_value_type: i64,
    limit: i64,
) -> Result<Vec<RelatedConstellation>> {
    let rows = sqlx::query_as::<_, RelatedRow>(
        r#"
        SELECT n.node_id AS node_id,
               f2.value_type AS related_value_type,
               vt.descriptor_hash AS descriptor_hash,
               vt.descriptor_json AS descriptor_json,
               n.hit_count AS hit_count,
               n.miss_count AS miss_count
        FROM knowledge_nodes n
        JOIN feature_vectors f1 ON f1.vector_id = n.vector_1_id
        JOIN feature_vectors f2 ON f2.vector_id = n.vector_2_id
        JOIN value_types vt ON vt.value_type_id = f2.value_type
        WHERE n.node_type = 'GROUP' AND f1.value_type = ?
        ORDER BY CAST(n.hit_count AS REAL) / (n.hit_count + n.miss_count + 1) DESC,
                 n.node_id ASC
        LIMIT ?
    "#,
    )
    .bind(anchor_value_type)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let descriptor: Descriptor = serde_json::from_str(&row.descriptor_json)
            .map_err(|e| EngineError::MalformedDescriptor(e.to_string()))?;
        let total = row.hit_count + row.miss_count;
        out.push(RelatedConstellation {
            node_id: row.node_id,
            related_value_type: row.related_value_type,
            descriptor_hash: row.descriptor_hash,
            descriptor,
            hit_count: row.hit_count,
            miss_count: row.miss_count,
            success_rate: if total > 0 {
                row.hit_count as f64 / total as f64
            } else {
                0.0
            },
        });
    }
    Ok(out)
}

/// Phase-2 pruning: GROUP nodes past the age cutoff that never accumulated
/// hits beyond the ceiling. Bounded and idempotent.
pub async fn delete_stale_groups(
    pool: &SqlitePool,
    min_age_minutes: i64,
    max_hit_count: i64,
    limit: i64,
) -> Result<u64> {
    let cutoff = chrono::Utc::now().timestamp() - min_age_minutes * 60;
    let result = sqlx::query(
        r#"
        DELETE FROM knowledge_nodes WHERE node_id IN (
            SELECT node_id FROM knowledge_nodes
            WHERE node_type = 'GROUP' AND created_at <= ? AND hit_count <= ?
            LIMIT ?
        )
    "#,
    )
    .bind(cutoff)
    .bind(max_hit_count)
    .bind(limit)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::features::{insert_feature_batch, resolve_value_type, NewFeature, ValueTypeCache};
    use crate::db::images::create_image;
    use crate::db::init_memory_pool;
    use crate::sample::descriptor_for_sample;

    async fn seed_vectors(pool: &SqlitePool, n: usize) -> Vec<i64> {
        let cache = ValueTypeCache::new();
        let img = create_image(pool, "seed.png").await.unwrap();
        let mut ids = Vec::new();
        for i in 0..n {
            let d = descriptor_for_sample(i as u64, 3);
            let vt = resolve_value_type(pool, &cache, &d, 4).await.unwrap();
            insert_feature_batch(
                pool,
                &[NewFeature {
                    image_id: img.image_id,
                    value_type: vt,
                    resolution_level: 80,
                    pos_x: 100 + i as i64,
                    pos_y: 100,
                    rel_x: 1.0,
                    rel_y: 0.0,
                    value: 0.1,
                    size: 0.08,
                }],
            )
            .await
            .unwrap();
            let row: (i64,) = sqlx::query_as("SELECT MAX(vector_id) FROM feature_vectors")
                .fetch_one(pool)
                .await
                .unwrap();
            ids.push(row.0);
        }
        ids
    }

    #[tokio::test]
    async fn test_feature_node_upsert_no_duplicates() {
        let pool = init_memory_pool().await.unwrap();
        let ids = seed_vectors(&pool, 1).await;

        let a = upsert_feature_node(&pool, ids[0], 1).await.unwrap();
        let b = upsert_feature_node(&pool, ids[0], 2).await.unwrap();
        assert_eq!(a, b);

        let (count, hits): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), MAX(hit_count) FROM knowledge_nodes WHERE node_type = 'FEATURE'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(hits, 3);
    }

    #[tokio::test]
    async fn test_group_node_parent_cascade() {
        let pool = init_memory_pool().await.unwrap();
        let ids = seed_vectors(&pool, 2).await;

        let parent = upsert_feature_node(&pool, ids[0], 1).await.unwrap();
        let group = upsert_group_node(&pool, parent, ids[0], ids[1], 0.5, 0.3, 0.1, 1)
            .await
            .unwrap();
        assert_ne!(parent, group);

        let row = sqlx::query_as::<_, KnowledgeNodeRow>(
            "SELECT * FROM knowledge_nodes WHERE node_id = ?",
        )
        .bind(group)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(row.node_type, NodeType::Group.as_str());
        assert_eq!(row.parent_node_id, Some(parent));
        assert_eq!(row.vector_2_id, Some(ids[1]));
        assert!((row.vector_length - 0.5).abs() < 1e-12);

        // Deleting the parent FEATURE node takes the GROUP child with it.
        sqlx::query("DELETE FROM knowledge_nodes WHERE node_id = ?")
            .bind(parent)
            .execute(&pool)
            .await
            .unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM knowledge_nodes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_vector_cascade_rules() {
        let pool = init_memory_pool().await.unwrap();
        let ids = seed_vectors(&pool, 2).await;
        let parent = upsert_feature_node(&pool, ids[0], 1).await.unwrap();
        upsert_group_node(&pool, parent, ids[0], ids[1], 0.5, 0.3, 0.1, 1)
            .await
            .unwrap();

        // Deleting vector_2 nulls the reference; the node survives.
        sqlx::query("DELETE FROM feature_vectors WHERE vector_id = ?")
            .bind(ids[1])
            .execute(&pool)
            .await
            .unwrap();
        let (nulls,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM knowledge_nodes WHERE node_type = 'GROUP' AND vector_2_id IS NULL",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(nulls, 1);

        // Deleting vector_1 removes the nodes built on it.
        sqlx::query("DELETE FROM feature_vectors WHERE vector_id = ?")
            .bind(ids[0])
            .execute(&pool)
            .await
            .unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM knowledge_nodes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_group_stat_incremental_means() {
        let pool = init_memory_pool().await.unwrap();
        let cache = ValueTypeCache::new();
        let d = descriptor_for_sample(0, 3);
        let vt = resolve_value_type(&pool, &cache, &d, 4).await.unwrap();

        bump_group_stat(&pool, vt, 80, 4, 1.0, 0.0, 0.2, 0.9, 0.8)
            .await
            .unwrap();
        bump_group_stat(&pool, vt, 80, 4, 3.0, 0.0, 0.4, 0.7, 0.6)
            .await
            .unwrap();

        let stats = top_group_stats(&pool, 10, 0).await.unwrap();
        assert_eq!(stats.len(), 1);
        let s = &stats[0];
        assert_eq!(s.sample_size, 8);
        assert!((s.mean_length - 2.0).abs() < 1e-9);
        assert!((s.mean_distance - 0.3).abs() < 1e-9);
        assert!((s.mean_cosine - 0.8).abs() < 1e-9);

        // Monotone sample size, never deleted by further bumps.
        bump_group_stat(&pool, vt, 80, 1, 0.0, 0.0, 0.0, 0.0, 0.0)
            .await
            .unwrap();
        let stats = top_group_stats(&pool, 10, 0).await.unwrap();
        assert_eq!(stats[0].sample_size, 9);
    }

    #[tokio::test]
    async fn test_related_constellations_ranked() {
        let pool = init_memory_pool().await.unwrap();
        let ids = seed_vectors(&pool, 3).await;
        let parent = upsert_feature_node(&pool, ids[0], 1).await.unwrap();

        let good = upsert_group_node(&pool, parent, ids[0], ids[1], 0.5, 0.1, 0.0, 10)
            .await
            .unwrap();
        let bad = upsert_group_node(&pool, parent, ids[0], ids[2], 0.7, 0.2, 0.0, 1)
            .await
            .unwrap();
        record_node_miss(&pool, bad).await.unwrap();
        record_node_miss(&pool, bad).await.unwrap();

        let anchor_vt: (i64,) =
            sqlx::query_as("SELECT value_type FROM feature_vectors WHERE vector_id = ?")
                .bind(ids[0])
                .fetch_one(&pool)
                .await
                .unwrap();
        let related = related_constellations(&pool, anchor_vt.0, 10).await.unwrap();
        assert_eq!(related.len(), 2);
        assert_eq!(related[0].node_id, good);
        assert!(related[0].success_rate > related[1].success_rate);
    }

    #[tokio::test]
    async fn test_delete_stale_groups_bounded() {
        let pool = init_memory_pool().await.unwrap();
        let ids = seed_vectors(&pool, 2).await;
        let parent = upsert_feature_node(&pool, ids[0], 1).await.unwrap();
        upsert_group_node(&pool, parent, ids[0], ids[1], 0.5, 0.1, 0.0, 1)
            .await
            .unwrap();

        // Too young to prune.
        assert_eq!(delete_stale_groups(&pool, 30, 1, 100).await.unwrap(), 0);
        // Age cutoff in the past, hit ceiling met.
        assert_eq!(delete_stale_groups(&pool, -1, 1, 100).await.unwrap(), 1);
        // Idempotent.
        assert_eq!(delete_stale_groups(&pool, -1, 1, 100).await.unwrap(), 0);
    }
}
