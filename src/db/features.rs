//! Feature store
//!
//! Value types, feature vectors and the usage/skip counters. Value types
//! are resolved through an explicitly-owned, read-mostly cache backed by a
//! two-phase idempotent write (non-locking read, insert-if-absent, re-read)
//! with bounded jittered retries on lock conflicts. Feature vectors are
//! bulk-inserted per value type and never mutated afterward.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, SqlitePool};
use tracing::debug;

use crate::descriptor::Descriptor;
use crate::error::{EngineError, Result};
use crate::metrics::FeatureVec;

/// SQLite bind-variable budget keeps bulk chunks below the host limit.
const BATCH_CHUNK_ROWS: usize = 80;

// ============================================================================
// Value-Type Cache
// ============================================================================

/// Explicitly-owned concurrent map from descriptor hash to value type id.
/// Populated lazily, never invalidated: entries are immutable after first
/// write, so concurrent duplicate inserts are benign.
#[derive(Debug, Default)]
pub struct ValueTypeCache {
    inner: RwLock<HashMap<String, i64>>,
}

impl ValueTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, descriptor_hash: &str) -> Option<i64> {
        self.inner
            .read()
            .expect("value-type cache poisoned")
            .get(descriptor_hash)
            .copied()
    }

    pub fn put(&self, descriptor_hash: String, value_type_id: i64) {
        self.inner
            .write()
            .expect("value-type cache poisoned")
            .insert(descriptor_hash, value_type_id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("value-type cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_lock_conflict(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db)
        if db.message().contains("locked") || db.message().contains("busy"))
}

async fn lock_backoff(attempt: u32) {
    let jitter = rand::thread_rng().gen_range(0..50u64);
    tokio::time::sleep(Duration::from_millis(20u64 * (1u64 << attempt) + jitter)).await;
}

/// Resolve (or create) the value type for a descriptor. Two-phase write:
/// read, `INSERT OR IGNORE`, re-read; the unique constraint on
/// `descriptor_hash` makes concurrent racers converge on one row.
pub async fn resolve_value_type(
    pool: &SqlitePool,
    cache: &ValueTypeCache,
    descriptor: &Descriptor,
    retry_attempts: u32,
) -> Result<i64> {
    let canonical = descriptor.canonicalize();
    let hash = canonical.hash();

    if let Some(id) = cache.get(&hash) {
        return Ok(id);
    }

    let mut attempt = 0;
    loop {
        match resolve_value_type_once(pool, &canonical, &hash).await {
            Ok(id) => {
                cache.put(hash, id);
                return Ok(id);
            }
            Err(EngineError::Database(e)) if is_lock_conflict(&e) && attempt < retry_attempts => {
                debug!("value_type insert lock conflict, attempt {attempt}");
                lock_backoff(attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn resolve_value_type_once(
    pool: &SqlitePool,
    canonical: &Descriptor,
    hash: &str,
) -> Result<i64> {
    if let Some((id,)) =
        sqlx::query_as::<_, (i64,)>("SELECT value_type_id FROM value_types WHERE descriptor_hash = ?")
            .bind(hash)
            .fetch_optional(pool)
            .await?
    {
        return Ok(id);
    }

    let json = serde_json::to_string(canonical)
        .map_err(|e| EngineError::other(format!("descriptor serialization: {e}")))?;
    sqlx::query(
        "INSERT OR IGNORE INTO value_types (descriptor_hash, descriptor_json, created_at) VALUES (?, ?, ?)",
    )
    .bind(hash)
    .bind(&json)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    let (id,) =
        sqlx::query_as::<_, (i64,)>("SELECT value_type_id FROM value_types WHERE descriptor_hash = ?")
            .bind(hash)
            .fetch_one(pool)
            .await?;
    Ok(id)
}

/// Look up a value type and its stored descriptor by hash.
pub async fn value_type_for_hash(
    pool: &SqlitePool,
    descriptor_hash: &str,
) -> Result<Option<(i64, Descriptor)>> {
    let row = sqlx::query_as::<_, (i64, String)>(
        "SELECT value_type_id, descriptor_json FROM value_types WHERE descriptor_hash = ?",
    )
    .bind(descriptor_hash)
    .fetch_optional(pool)
    .await?;

    match row {
        Some((id, json)) => {
            let d: Descriptor = serde_json::from_str(&json)
                .map_err(|e| EngineError::MalformedDescriptor(e.to_string()))?;
            Ok(Some((id, d)))
        }
        None => Ok(None),
    }
}

/// A uniformly random descriptor that actually has stored features; the
/// opening-probe fallback when no knowledge guidance exists yet.
pub async fn random_stored_descriptor(pool: &SqlitePool) -> Result<Option<Descriptor>> {
    let row = sqlx::query_as::<_, (String,)>(
        r#"
        SELECT descriptor_json FROM value_types vt
        WHERE EXISTS (SELECT 1 FROM feature_vectors f WHERE f.value_type = vt.value_type_id)
        ORDER BY RANDOM()
        LIMIT 1
    "#,
    )
    .fetch_optional(pool)
    .await?;
    match row {
        Some((json,)) => Ok(Some(serde_json::from_str(&json).map_err(|e| {
            EngineError::MalformedDescriptor(e.to_string())
        })?)),
        None => Ok(None),
    }
}

pub async fn descriptor_for_value_type(
    pool: &SqlitePool,
    value_type_id: i64,
) -> Result<Option<Descriptor>> {
    let row = sqlx::query_as::<_, (String,)>(
        "SELECT descriptor_json FROM value_types WHERE value_type_id = ?",
    )
    .bind(value_type_id)
    .fetch_optional(pool)
    .await?;
    match row {
        Some((json,)) => Ok(Some(serde_json::from_str(&json).map_err(|e| {
            EngineError::MalformedDescriptor(e.to_string())
        })?)),
        None => Ok(None),
    }
}

// ============================================================================
// Feature Vectors
// ============================================================================

/// A stored measurement. The integer quadruple `(value_type,
/// resolution_level, pos_x, pos_y)` is the lookup key; `rel_x/rel_y/size/
/// value` are the match payload.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FeatureRow {
    pub vector_id: i64,
    pub image_id: i64,
    pub value_type: i64,
    pub resolution_level: i64,
    pub pos_x: i64,
    pub pos_y: i64,
    pub rel_x: f64,
    pub rel_y: f64,
    pub value: f64,
    pub size: f64,
    pub created_at: i64,
}

/// Insert payload for one feature vector.
#[derive(Debug, Clone)]
pub struct NewFeature {
    pub image_id: i64,
    pub value_type: i64,
    pub resolution_level: i64,
    pub pos_x: i64,
    pub pos_y: i64,
    pub rel_x: f64,
    pub rel_y: f64,
    pub value: f64,
    pub size: f64,
}

/// Project a stored row to its comparable 4-vector form.
pub fn feature_vec_for_row(row: &FeatureRow) -> FeatureVec {
    FeatureVec {
        value_type: row.value_type,
        resolution_level: row.resolution_level,
        value: row.value,
        rel_x: row.rel_x,
        rel_y: row.rel_y,
        size: row.size,
    }
}

/// Bulk-insert features, chunked below the bind-variable limit. Returns the
/// number of rows written.
pub async fn insert_feature_batch(pool: &SqlitePool, features: &[NewFeature]) -> Result<u64> {
    if features.is_empty() {
        return Ok(0);
    }
    let now = chrono::Utc::now().timestamp();
    let mut written = 0u64;

    for chunk in features.chunks(BATCH_CHUNK_ROWS) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT INTO feature_vectors \
             (image_id, value_type, resolution_level, pos_x, pos_y, rel_x, rel_y, value, size, created_at) ",
        );
        builder.push_values(chunk, |mut b, f| {
            b.push_bind(f.image_id)
                .push_bind(f.value_type)
                .push_bind(f.resolution_level)
                .push_bind(f.pos_x)
                .push_bind(f.pos_y)
                .push_bind(f.rel_x)
                .push_bind(f.rel_y)
                .push_bind(f.value)
                .push_bind(f.size)
                .push_bind(now);
        });
        let result = builder.build().execute(pool).await?;
        written += result.rows_affected();
    }
    Ok(written)
}

pub async fn features_for_image(pool: &SqlitePool, image_id: i64) -> Result<Vec<FeatureRow>> {
    let rows = sqlx::query_as::<_, FeatureRow>(
        "SELECT * FROM feature_vectors WHERE image_id = ? ORDER BY vector_id",
    )
    .bind(image_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn random_feature_for_image(
    pool: &SqlitePool,
    image_id: i64,
) -> Result<Option<FeatureRow>> {
    let row = sqlx::query_as::<_, FeatureRow>(
        "SELECT * FROM feature_vectors WHERE image_id = ? ORDER BY RANDOM() LIMIT 1",
    )
    .bind(image_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Same-key features on other, ingestion-complete images whose resolution
/// level and relative offsets sit within tolerance of the anchor feature.
/// The caller applies the 4-D distance filter.
pub async fn ambiguity_features(
    pool: &SqlitePool,
    anchor: &FeatureRow,
    level_tolerance: i64,
    offset_tolerance: f64,
) -> Result<Vec<FeatureRow>> {
    let rows = sqlx::query_as::<_, FeatureRow>(
        r#"
        SELECT f.* FROM feature_vectors f
        JOIN images i ON i.image_id = f.image_id
        WHERE f.value_type = ? AND f.pos_x = ? AND f.pos_y = ?
          AND f.image_id != ?
          AND i.ingestion_complete = 1
          AND ABS(f.resolution_level - ?) <= ?
          AND ABS(f.rel_x - ?) <= ?
          AND ABS(f.rel_y - ?) <= ?
    "#,
    )
    .bind(anchor.value_type)
    .bind(anchor.pos_x)
    .bind(anchor.pos_y)
    .bind(anchor.image_id)
    .bind(anchor.resolution_level)
    .bind(level_tolerance)
    .bind(anchor.rel_x)
    .bind(offset_tolerance)
    .bind(anchor.rel_y)
    .bind(offset_tolerance)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Features sharing a discriminator's key on a given set of images.
pub async fn same_key_features_for_images(
    pool: &SqlitePool,
    value_type: i64,
    pos_x: i64,
    pos_y: i64,
    image_ids: &[i64],
) -> Result<Vec<FeatureRow>> {
    if image_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
        "SELECT * FROM feature_vectors WHERE value_type = ",
    );
    builder.push_bind(value_type);
    builder.push(" AND pos_x = ").push_bind(pos_x);
    builder.push(" AND pos_y = ").push_bind(pos_y);
    builder.push(" AND image_id IN (");
    let mut separated = builder.separated(", ");
    for id in image_ids {
        separated.push_bind(*id);
    }
    builder.push(")");

    let rows = builder
        .build_query_as::<FeatureRow>()
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Delete a bounded slice of feature vectors belonging to the given value
/// types. Returns rows removed.
pub async fn delete_features_for_value_types(
    pool: &SqlitePool,
    value_types: &[i64],
    limit: i64,
) -> Result<u64> {
    if value_types.is_empty() || limit <= 0 {
        return Ok(0);
    }
    let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
        "DELETE FROM feature_vectors WHERE vector_id IN \
         (SELECT vector_id FROM feature_vectors WHERE value_type IN (",
    );
    let mut separated = builder.separated(", ");
    for vt in value_types {
        separated.push_bind(*vt);
    }
    builder.push(") LIMIT ").push_bind(limit).push(")");

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

// ============================================================================
// Usage & Skip Counters
// ============================================================================

/// Monotonic at-least-once accounting: lost updates are tolerated.
pub async fn record_usage(pool: &SqlitePool, vector_id: i64, score: Option<f64>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO feature_usage (vector_id, usage_count, last_used, last_score)
        VALUES (?, 1, ?, ?)
        ON CONFLICT (vector_id) DO UPDATE SET
            usage_count = usage_count + 1,
            last_used = excluded.last_used,
            last_score = COALESCE(excluded.last_score, feature_usage.last_score)
    "#,
    )
    .bind(vector_id)
    .bind(chrono::Utc::now().timestamp())
    .bind(score)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SkipPattern {
    pub descriptor_hash: String,
    pub skip_count: i64,
    pub last_used: Option<i64>,
}

/// Count one rejection of a descriptor as unhelpful during a session.
pub async fn record_skip(pool: &SqlitePool, descriptor_hash: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO skip_patterns (descriptor_hash, skip_count, last_used)
        VALUES (?, 1, ?)
        ON CONFLICT (descriptor_hash) DO UPDATE SET
            skip_count = skip_count + 1,
            last_used = excluded.last_used
    "#,
    )
    .bind(descriptor_hash)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn skip_patterns_above(
    pool: &SqlitePool,
    min_skip_count: i64,
) -> Result<Vec<SkipPattern>> {
    let rows = sqlx::query_as::<_, SkipPattern>(
        "SELECT * FROM skip_patterns WHERE skip_count >= ? ORDER BY skip_count DESC",
    )
    .bind(min_skip_count)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
