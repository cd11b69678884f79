//! System settings
//!
//! Small key/value table for knobs that can change at runtime. Today that
//! is the capacity target the storage governor reads before pruning.

use sqlx::SqlitePool;

use crate::error::Result;

pub const MAX_DB_SIZE_GB_KEY: &str = "max_db_size_gb";

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row = sqlx::query_as::<_, (String,)>("SELECT value FROM system_settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v))
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO system_settings (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT (key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
    "#,
    )
    .bind(key)
    .bind(value)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

/// Capacity target in gigabytes; the stored setting wins over the env
/// default.
pub async fn max_db_size_gb(pool: &SqlitePool, fallback: f64) -> Result<f64> {
    Ok(get_setting(pool, MAX_DB_SIZE_GB_KEY)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback))
}
