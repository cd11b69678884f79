//! Engine error types
//!
//! A single typed error enum for the library surface. Binaries and HTTP
//! handlers convert into `anyhow`/status codes at the edge.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Database failure after bounded retries.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Raster decode or transform failure. Never retried.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Probe or descriptor blob that fails canonical parsing. Maps to 400.
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// Augmentation name outside the fixed set. Fatal at job scope.
    #[error("unknown augmentation: {0}")]
    UnknownAugmentation(String),

    /// Session id with no live entry. Maps to 404.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Image lookup by id or filename missed. Maps to 404.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Discovery needs at least two ingestion-complete images.
    #[error("insufficient images for discovery")]
    InsufficientImages,

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
