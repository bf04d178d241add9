//! Error types for the collect core library.

use std::path::PathBuf;

use crate::models::AssetStatus;

/// Top-level error enum for the collect core library.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for asset {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: AssetStatus,
        to: AssetStatus,
    },

    #[error("Invalid upload descriptor: {0}")]
    Descriptor(String),

    #[error("Instance directory unreadable: {path}: {source}")]
    InstanceListing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Upload pipeline is already running a batch")]
    PipelineBusy,

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type CollectResult<T> = Result<T, CollectError>;
