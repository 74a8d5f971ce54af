//! Cache Store Module
//!
//! Main cache engine combining the two-tier file layout with the bucket
//! lock hierarchy.
//!
//! The happy read path takes no locks at all: a fresh entry is found by
//! computed path and decoded. Everything else follows the lock protocol:
//! writers double-check the bucket's invalidation token across write-lock
//! acquisition so a racing delete can never be overwritten by a value
//! computed before it; readers that miss take one short rebuild-lock
//! attempt and otherwise degrade to the stale tier.
//!
//! The three public operations never fail: every internal error is logged
//! and absorbed, a failed `set` is indistinguishable from one that did not
//! happen.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::entry;
use crate::cache::files::{self, SweepMode};
use crate::cache::stats::CacheStats;
use crate::cache::MAX_KEY_LENGTH;
use crate::config::{Config, TestMode};
use crate::error::{CacheError, Result};
use crate::lock::BucketLocks;
use crate::path;
use crate::tasks::gc;

// == Magic Key Forms ==
/// Key that wipes the entire cache tree.
pub const WIPE_KEY: &str = "*";
/// Prefix that turns a delete into a destructive purge of the key subtree.
pub const PURGE_PREFIX: &str = "__PURGE__";

// == Delete Target ==
/// What a `delete` call is aimed at, parsed from the magic key forms at
/// the public boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteTarget {
    /// `"*"`: wipe everything under the cache root
    All,
    /// Targeted invalidation with fresh→stale promotion
    Key(String),
    /// `"__PURGE__<key>"`: destructive removal of the key subtree
    Purge(String),
}

impl DeleteTarget {
    /// Parses a raw delete key into its command form.
    pub fn parse(key: &str) -> Self {
        if key == WIPE_KEY {
            DeleteTarget::All
        } else if let Some(inner) = key.strip_prefix(PURGE_PREFIX) {
            DeleteTarget::Purge(inner.to_string())
        } else {
            DeleteTarget::Key(key.to_string())
        }
    }
}

// == Cache Store ==
/// Filesystem-backed cache engine.
///
/// Each process opens its own `CacheStore` over a shared root; coordination
/// between processes happens exclusively through the advisory lock anchors,
/// never through shared memory.
#[derive(Debug)]
pub struct CacheStore {
    /// Engine configuration
    config: Config,
    /// Per-bucket lock factory
    locks: BucketLocks,
    /// Process-local performance counters
    stats: CacheStats,
    /// Whether `shutdown` has already run
    shut_down: bool,
}

impl CacheStore {
    // == Constructor ==
    /// Creates a store over the configured cache root, creating the root
    /// directory if needed.
    pub fn new(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.cache_root)
            .map_err(|err| CacheError::io(&config.cache_root, err))?;
        let locks = BucketLocks::new(&config.cache_root);
        Ok(Self {
            config,
            locks,
            stats: CacheStats::new(),
            shut_down: false,
        })
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a snapshot of the process-local counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }

    // == Get ==
    /// Retrieves a value by key. Never raises.
    ///
    /// Fresh entries are served without touching any lock. On a fresh-tier
    /// miss the store makes one short rebuild-lock attempt: winning it
    /// means "you must rebuild" (returns None after holding the lock for
    /// the grace delay, which caps concurrent rebuilds at one per window
    /// per bucket); losing it means another rebuild or a delete is in
    /// flight, and the stale tier is served instead.
    pub fn get<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        if key.len() > MAX_KEY_LENGTH {
            debug!("get ignored: key exceeds {} bytes", MAX_KEY_LENGTH);
            return None;
        }
        let dir = path::data_dir(&self.config.cache_root, key)?;
        let bucket = path::bucket(key)?;

        let now = entry::current_epoch();
        let skip_expiry = self.config.never_expire();
        for slot in files::list_fresh(&dir) {
            if !skip_expiry && !slot.is_fresh(now) {
                continue;
            }
            if let Some(value) = files::read_payload(&slot.path) {
                self.stats.record_fresh_hit();
                return Some(value);
            }
        }

        if let Some(rebuild_guard) = self
            .locks
            .acquire_rebuild(&bucket, self.config.rebuild_lock_timeout_ms)
        {
            // Concurrent misses in this bucket fail the same acquisition
            // while we hold it and fall through to the stale tier below
            thread::sleep(Duration::from_micros(self.config.get_grace_delay_us));
            drop(rebuild_guard);
            self.stats.record_rebuild_grant();
            self.stats.record_miss();
            debug!("get {}: miss, rebuild granted", key);
            return None;
        }

        for slot in files::list_stale(&dir) {
            if let Some(value) = files::read_payload(&slot.path) {
                self.stats.record_stale_hit();
                debug!("get {}: served stale while rebuild in flight", key);
                return Some(value);
            }
        }
        self.stats.record_miss();
        None
    }

    // == Set ==
    /// Stores a value under a key. `expire_secs` of 0 means the default
    /// TTL. Never raises; a failed set is indistinguishable from one that
    /// did not happen.
    ///
    /// The invalidation token is captured before any lock or side effect
    /// and re-checked under the write lock. A mismatch means a delete
    /// completed in between: the pending value was computed against
    /// pre-invalidation state and must not be published.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T, expire_secs: u64) {
        if key.len() > MAX_KEY_LENGTH {
            debug!("set ignored: key exceeds {} bytes", MAX_KEY_LENGTH);
            return;
        }
        let (Some(dir), Some(bucket)) = (
            path::data_dir(&self.config.cache_root, key),
            path::bucket(key),
        ) else {
            return;
        };

        let token_before = self.locks.invalidation_token(&bucket);

        if self.config.test_mode == Some(TestMode::LagSetInit) {
            thread::sleep(Duration::from_secs(3));
        }

        if !self.locks.check_delete(&bucket) {
            debug!("set {} aborted: delete in flight", key);
            self.stats.record_aborted_write();
            return;
        }

        let Some(_write_guard) = self
            .locks
            .acquire_write(&bucket, self.config.write_lock_timeout_ms)
        else {
            debug!("set {} aborted: write lock timeout", key);
            self.stats.record_aborted_write();
            return;
        };

        if !self.locks.check_delete(&bucket) {
            debug!("set {} aborted: delete started while acquiring", key);
            self.stats.record_aborted_write();
            return;
        }
        let token_now = self.locks.invalidation_token(&bucket);
        if token_now != token_before {
            debug!(
                "set {} aborted: invalidation token moved {} -> {}",
                key, token_before, token_now
            );
            self.stats.record_aborted_write();
            return;
        }

        if let Err(err) = self.write_entry(&dir, value, expire_secs) {
            warn!("set {} failed: {}", key, err);
        }
    }

    fn write_entry<T: Serialize>(
        &mut self,
        dir: &Path,
        value: &T,
        expire_secs: u64,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        fs::create_dir_all(dir).map_err(|err| CacheError::io(dir, err))?;

        let existing = files::list_fresh(dir);
        if existing.len() >= self.config.max_stale_files {
            // The incoming write is the newest entry; every fresh copy left
            // behind by racing writers is superseded
            files::prune_older(&existing, 0);
        }

        let ttl = if expire_secs == 0 {
            self.config.default_ttl_secs
        } else {
            expire_secs
        };
        let epoch = entry::current_epoch() + ttl;
        files::publish(dir, epoch, &payload)
    }

    // == Delete ==
    /// Deletes by key, honoring the magic forms: `"*"` wipes the whole
    /// cache and `"__PURGE__<key>"` destructively purges one subtree.
    /// A plain key is invalidated with fresh→stale promotion, so readers
    /// colliding with the invalidation still see the previous value.
    /// Never raises.
    pub fn delete(&mut self, key: &str) {
        match DeleteTarget::parse(key) {
            DeleteTarget::All => self.wipe(),
            DeleteTarget::Purge(inner) => self.purge(&inner),
            DeleteTarget::Key(inner) => self.invalidate(&inner),
        }
    }

    fn invalidate(&mut self, key: &str) {
        if key.len() > MAX_KEY_LENGTH {
            return;
        }
        let (Some(dir), Some(bucket)) = (
            path::data_dir(&self.config.cache_root, key),
            path::bucket(key),
        ) else {
            return;
        };

        // Best-effort: a delete that cannot take its own lock still runs,
        // it just loses its exclusion against other deleters
        let delete_guard = self
            .locks
            .acquire_delete(&bucket, self.config.delete_lock_timeout_ms);
        if delete_guard.is_none() {
            warn!("delete {}: proceeding without delete lock", key);
        }

        self.locks.mark_invalidation(&bucket);

        let Some(_write_guard) = self
            .locks
            .acquire_write(&bucket, self.config.delete_lock_timeout_ms)
        else {
            warn!("delete {} aborted: write lock timeout", key);
            return;
        };

        // Held through the swap so readers-on-miss degrade to the stale
        // tier instead of rebuilding against a half-swapped directory
        let _rebuild_guard = self
            .locks
            .acquire_rebuild(&bucket, self.config.rebuild_lock_timeout_ms);

        let outcome = files::sweep_tree(&dir, SweepMode::Invalidate, false);
        self.stats.record_promotions(outcome.promoted);
        debug!(
            "delete {}: promoted {}, removed {}",
            key, outcome.promoted, outcome.removed
        );
    }

    // == Purge ==
    /// Destructively removes every payload under the key's subtree, both
    /// tiers, and prunes emptied non-bucket directories. Used when a key is
    /// being removed for good rather than rebuilt. Never raises.
    pub fn purge(&mut self, key: &str) {
        if key.len() > MAX_KEY_LENGTH {
            return;
        }
        let (Some(dir), Some(bucket)) = (
            path::data_dir(&self.config.cache_root, key),
            path::bucket(key),
        ) else {
            return;
        };

        let delete_guard = self
            .locks
            .acquire_delete(&bucket, self.config.delete_lock_timeout_ms);
        if delete_guard.is_none() {
            warn!("purge {}: proceeding without delete lock", key);
        }

        self.locks.mark_invalidation(&bucket);

        let Some(_write_guard) = self
            .locks
            .acquire_write(&bucket, self.config.delete_lock_timeout_ms)
        else {
            warn!("purge {} aborted: write lock timeout", key);
            return;
        };

        let _rebuild_guard = self
            .locks
            .acquire_rebuild(&bucket, self.config.rebuild_lock_timeout_ms);

        let outcome = files::sweep_tree(&dir, SweepMode::Purge, true);
        debug!("purge {}: removed {}", key, outcome.removed);

        // Walk emptied intermediates up towards the bucket root; the bucket
        // directory itself (and its lock anchors) always survives
        let bucket_root = path::bucket_dir(&self.config.cache_root, &bucket);
        let mut cursor = dir;
        while cursor != bucket_root && cursor.starts_with(&bucket_root) {
            if fs::remove_dir(&cursor).is_err() {
                break;
            }
            match cursor.parent() {
                Some(parent) => cursor = parent.to_path_buf(),
                None => break,
            }
        }
    }

    fn wipe(&mut self) {
        // Global wipe is best-effort and lock-free by design
        info!("wiping cache root {}", self.config.cache_root.display());
        let entries = match fs::read_dir(&self.config.cache_root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("wipe failed to list cache root: {}", err);
                return;
            }
        };
        for dir_entry in entries.flatten() {
            let target = dir_entry.path();
            let removed = if target.is_dir() {
                fs::remove_dir_all(&target)
            } else {
                fs::remove_file(&target)
            };
            if let Err(err) = removed {
                debug!("wipe could not remove {}: {}", target.display(), err);
            }
        }
    }

    // == Shutdown ==
    /// Tears the engine down, giving garbage collection its chance to run.
    /// GC is time-gated and single-flight across processes, so most
    /// shutdowns are a cheap no-op. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if let Some(summary) = gc::run(&self.config, &self.locks) {
            self.stats.record_promotions(summary.promoted);
        }
    }
}
