use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure reported by a durable store (quota counters, assignment records).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store file '{path}' could not be accessed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("store file '{path}' is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reported by a dataset provider.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("dataset '{dataset}' is unavailable: {reason}")]
    Unavailable { dataset: String, reason: String },
    #[error("dataset '{dataset}' could not be parsed: {reason}")]
    Malformed { dataset: String, reason: String },
    #[error("dataset '{dataset}' was rejected: {reason}")]
    Rejected { dataset: String, reason: String },
}

/// Failure reported by a Map Surface implementation.
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("map surface has no live session")]
    NoSession,
    #[error("map surface rejected the request: {0}")]
    Rejected(String),
}

/// Umbrella error for the engine.
#[derive(Debug, Error)]
pub enum GridError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error("configuration error: {0}")]
    Configuration(String),
}
