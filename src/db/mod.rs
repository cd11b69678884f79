//! Database module
//!
//! SQLite-backed feature store: images, value types, feature vectors,
//! usage/skip counters, the knowledge graph and its aggregates. The
//! database is the single source of truth; every mutation goes through it.

pub mod features;
pub mod images;
pub mod knowledge;
pub mod settings;

pub use features::{
    ambiguity_features, delete_features_for_value_types, descriptor_for_value_type,
    feature_vec_for_row, features_for_image, insert_feature_batch, random_feature_for_image,
    random_stored_descriptor, record_skip, record_usage, resolve_value_type,
    same_key_features_for_images,
    skip_patterns_above, value_type_for_hash, FeatureRow, NewFeature, SkipPattern, ValueTypeCache,
};
pub use images::{
    count_complete_images, count_images, create_image, delete_image, get_image,
    get_image_by_filename, mark_ingestion_complete, random_complete_image, ImageRow,
};
pub use knowledge::{
    bump_group_stat, delete_stale_groups, record_node_miss, related_constellations,
    top_group_stats, upsert_feature_node, upsert_group_node, FeatureGroupStat, KnowledgeNodeRow,
    NodeType, RelatedConstellation,
};
pub use settings::{get_setting, max_db_size_gb, set_setting, MAX_DB_SIZE_GB_KEY};

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::config::Settings;

// ============================================================================
// Pool Creation
// ============================================================================

/// Initialize the connection pool and create the schema.
pub async fn init_pool(settings: &Settings) -> Result<SqlitePool> {
    if let Some(parent) = settings.db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }
    }

    let db_url = format!("sqlite:{}?mode=rwc", settings.db_path.display());
    info!("Connecting to database: {}", settings.db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Normal)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(settings.db_max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to database: {}", settings.db_path.display()))?;

    create_schema(&pool).await?;
    Ok(pool)
}

/// In-memory pool for tests and ephemeral runs. A single connection keeps
/// the in-memory database alive and shared.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

// ============================================================================
// Schema
// ============================================================================

/// Create every table and index. Idempotent.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS images (
            image_id INTEGER PRIMARY KEY AUTOINCREMENT,
            filename TEXT NOT NULL,
            ingestion_complete INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS value_types (
            value_type_id INTEGER PRIMARY KEY AUTOINCREMENT,
            descriptor_hash TEXT NOT NULL UNIQUE,
            descriptor_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feature_vectors (
            vector_id INTEGER PRIMARY KEY AUTOINCREMENT,
            image_id INTEGER NOT NULL REFERENCES images(image_id) ON DELETE CASCADE,
            value_type INTEGER NOT NULL REFERENCES value_types(value_type_id) ON DELETE CASCADE,
            resolution_level INTEGER NOT NULL,
            pos_x INTEGER NOT NULL,
            pos_y INTEGER NOT NULL,
            rel_x REAL NOT NULL,
            rel_y REAL NOT NULL,
            value REAL NOT NULL,
            size REAL NOT NULL,
            created_at INTEGER NOT NULL
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_feature_lookup
        ON feature_vectors (value_type, resolution_level, pos_x, pos_y)
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_feature_image
        ON feature_vectors (image_id)
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feature_usage (
            vector_id INTEGER PRIMARY KEY REFERENCES feature_vectors(vector_id) ON DELETE CASCADE,
            usage_count INTEGER NOT NULL DEFAULT 0,
            last_used INTEGER,
            last_score REAL
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS skip_patterns (
            descriptor_hash TEXT PRIMARY KEY,
            skip_count INTEGER NOT NULL DEFAULT 0,
            last_used INTEGER
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS system_settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_nodes (
            node_id INTEGER PRIMARY KEY AUTOINCREMENT,
            parent_node_id INTEGER REFERENCES knowledge_nodes(node_id) ON DELETE CASCADE,
            node_type TEXT NOT NULL,
            vector_1_id INTEGER NOT NULL REFERENCES feature_vectors(vector_id) ON DELETE CASCADE,
            vector_2_id INTEGER REFERENCES feature_vectors(vector_id) ON DELETE SET NULL,
            vector_length REAL NOT NULL DEFAULT 0,
            vector_angle REAL NOT NULL DEFAULT 0,
            vector_value REAL NOT NULL DEFAULT 0,
            hit_count INTEGER NOT NULL DEFAULT 0,
            miss_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE (node_type, vector_1_id, vector_2_id, vector_length, vector_angle)
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feature_group_stats (
            stat_id INTEGER PRIMARY KEY AUTOINCREMENT,
            value_type INTEGER NOT NULL REFERENCES value_types(value_type_id) ON DELETE CASCADE,
            resolution_level INTEGER NOT NULL,
            sample_size INTEGER NOT NULL DEFAULT 0,
            mean_length REAL NOT NULL DEFAULT 0,
            mean_angle REAL NOT NULL DEFAULT 0,
            mean_distance REAL NOT NULL DEFAULT 0,
            mean_cosine REAL NOT NULL DEFAULT 0,
            mean_pearson REAL NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            UNIQUE (value_type, resolution_level)
        )
    "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Health & Stats
// ============================================================================

#[derive(Debug, Clone, serde::Serialize)]
pub struct CorpusStats {
    pub images: i64,
    pub complete_images: i64,
    pub feature_vectors: i64,
    pub value_types: i64,
    pub knowledge_nodes: i64,
}

pub async fn corpus_stats(pool: &SqlitePool) -> Result<CorpusStats> {
    let images: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM images")
        .fetch_one(pool)
        .await?;
    let complete: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM images WHERE ingestion_complete = 1")
            .fetch_one(pool)
            .await?;
    let features: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feature_vectors")
        .fetch_one(pool)
        .await?;
    let value_types: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM value_types")
        .fetch_one(pool)
        .await?;
    let nodes: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM knowledge_nodes")
        .fetch_one(pool)
        .await?;

    Ok(CorpusStats {
        images: images.0,
        complete_images: complete.0,
        feature_vectors: features.0,
        value_types: value_types.0,
        knowledge_nodes: nodes.0,
    })
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseHealth {
    pub connected: bool,
    pub latency_ms: u64,
    pub stats: CorpusStats,
}

/// Check database health with a trivial round trip.
pub async fn health_check(pool: &SqlitePool) -> Result<DatabaseHealth> {
    let start = std::time::Instant::now();
    let result: (i32,) = sqlx::query_as("SELECT 1")
        .fetch_one(pool)
        .await
        .context("Database health check failed")?;
    let latency = start.elapsed();

    Ok(DatabaseHealth {
        connected: result.0 == 1,
        latency_ms: latency.as_millis() as u64,
        stats: corpus_stats(pool).await?,
    })
}

/// Total on-disk size of the schema in bytes, via SQLite pragmas.
pub async fn database_size_bytes(pool: &SqlitePool) -> crate::error::Result<i64> {
    let page_count: (i64,) = sqlx::query_as("PRAGMA page_count")
        .fetch_one(pool)
        .await?;
    let page_size: (i64,) = sqlx::query_as("PRAGMA page_size").fetch_one(pool).await?;
    Ok(page_count.0 * page_size.0)
}
