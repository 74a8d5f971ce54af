//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror.
//!
//! Errors never cross the public boundary: `get`, `set` and `delete` absorb
//! every failure (logging it through `tracing`) and degrade to a miss or a
//! no-op. The types below are the internal channel between the file layer,
//! the lock layer and the store.

use std::path::PathBuf;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache engine.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A filesystem operation failed at a known path
    #[error("i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A value could not be serialized for publication
    #[error("encode failure: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CacheError {
    /// Wraps an `io::Error` with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;
