//! Stratacache - a filesystem-backed two-tier key/value cache
//!
//! Serves large catalogs under heavy multi-process read load from a shared
//! directory tree, with no coordinating daemon. Lookup is O(1) by
//! deterministic path construction; availability during invalidation
//! storms comes from a fresh/stale two-tier layout; and a three-level lock
//! hierarchy (delete > write > rebuild) prevents stale publications,
//! thundering-herd rebuilds and cascading misses.

pub mod cache;
pub mod config;
pub mod error;
pub mod lock;
pub mod path;
pub mod tasks;

pub use cache::{CacheStats, CacheStore, DeleteTarget, MAX_KEY_LENGTH};
pub use config::{Config, TestMode, NEVER_EXPIRE_TTL_SECS};
pub use error::{CacheError, Result};
