//! Imprint Server
//!
//! Standalone HTTP entry point for the probing protocol and corpus
//! management endpoints.

use imprint::{config::Settings, db};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,imprint=debug".into()),
        )
        .init();

    let settings = Settings::from_env();
    info!(
        "starting imprint server (db: {})",
        settings.db_path.display()
    );

    let pool = db::init_pool(&settings).await?;
    imprint::run_server(pool, settings).await
}
