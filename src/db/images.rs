//! Image rows
//!
//! An image record is created with `ingestion_complete = 0` and flipped to
//! 1 exactly once, after all of its feature batches are persisted. That
//! flag fences non-atomic ingestion: discovery and knowledge reads must
//! filter on it. Deletion cascades to feature vectors and onward.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImageRow {
    pub image_id: i64,
    /// Original filename as supplied at ingest.
    pub filename: String,
    pub ingestion_complete: bool,
    pub created_at: i64,
}

pub async fn create_image(pool: &SqlitePool, filename: &str) -> Result<ImageRow> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "INSERT INTO images (filename, ingestion_complete, created_at) VALUES (?, 0, ?)",
    )
    .bind(filename)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(ImageRow {
        image_id: result.last_insert_rowid(),
        filename: filename.to_string(),
        ingestion_complete: false,
        created_at: now,
    })
}

/// One-way transition once every feature batch is persisted.
pub async fn mark_ingestion_complete(pool: &SqlitePool, image_id: i64) -> Result<()> {
    sqlx::query("UPDATE images SET ingestion_complete = 1 WHERE image_id = ?")
        .bind(image_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_image(pool: &SqlitePool, image_id: i64) -> Result<ImageRow> {
    sqlx::query_as::<_, ImageRow>("SELECT * FROM images WHERE image_id = ?")
        .bind(image_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::ImageNotFound(image_id.to_string()))
}

pub async fn get_image_by_filename(pool: &SqlitePool, filename: &str) -> Result<ImageRow> {
    sqlx::query_as::<_, ImageRow>("SELECT * FROM images WHERE filename = ? LIMIT 1")
        .bind(filename)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::ImageNotFound(filename.to_string()))
}

/// Delete the image row; feature vectors, usage rows and knowledge nodes
/// fall with it through the cascade chain.
pub async fn delete_image(pool: &SqlitePool, image_id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM images WHERE image_id = ?")
        .bind(image_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(EngineError::ImageNotFound(image_id.to_string()));
    }
    Ok(())
}

pub async fn count_images(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM images")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

pub async fn count_complete_images(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM images WHERE ingestion_complete = 1")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// A uniformly random ingestion-complete image at least `min_age_secs` old,
/// or `None` when the corpus has no eligible row.
pub async fn random_complete_image(
    pool: &SqlitePool,
    min_age_secs: i64,
) -> Result<Option<ImageRow>> {
    let cutoff = chrono::Utc::now().timestamp() - min_age_secs;
    let row = sqlx::query_as::<_, ImageRow>(
        r#"
        SELECT * FROM images
        WHERE ingestion_complete = 1 AND created_at <= ?
        ORDER BY RANDOM()
        LIMIT 1
    "#,
    )
    .bind(cutoff)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}
