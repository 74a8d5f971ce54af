//! Bucket Lock Module
//!
//! Per-bucket advisory locking over three named anchor files, shared by
//! every process operating on the same cache tree.
//!
//! Each bucket directory carries `lock-delete`, `lock-write` and
//! `lock-rebuild`. Holding `delete` stops writers and GC at their
//! delete-check; holding `write` excludes other writers; holding `rebuild`
//! makes readers-on-miss fall back to stale data instead of rebuilding.
//! Anchors are only ever taken in Delete → Write → Rebuild order, which
//! rules out AB/BA deadlocks between operations.
//!
//! The `lock-delete` anchor doubles as the invalidation token: its
//! modification timestamp records the last invalidation event. Writers
//! capture the token before doing any work and re-check it under the write
//! lock; a mismatch means a delete completed in between and the pending
//! value must not be published.
//!
//! Anchor files are never unlinked by the engine. External deletion of an
//! anchor is a tolerated chaos event; the next acquisition re-creates it.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs4::FileExt;
use tracing::debug;

use crate::path;

// == Anchor Names ==
/// Delete-lock anchor; its mtime is the bucket's invalidation token.
pub const LOCK_DELETE_FILE: &str = "lock-delete";
/// Write-lock anchor.
pub const LOCK_WRITE_FILE: &str = "lock-write";
/// Rebuild-lock anchor.
pub const LOCK_REBUILD_FILE: &str = "lock-rebuild";

/// Sleep between non-blocking acquisition attempts.
const ACQUIRE_BACKOFF: Duration = Duration::from_millis(5);

// == Lock Kind ==
/// The three per-bucket lock anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Delete,
    Write,
    Rebuild,
}

impl LockKind {
    /// Anchor filename within the bucket directory.
    pub fn anchor(self) -> &'static str {
        match self {
            LockKind::Delete => LOCK_DELETE_FILE,
            LockKind::Write => LOCK_WRITE_FILE,
            LockKind::Rebuild => LOCK_REBUILD_FILE,
        }
    }

    fn label(self) -> &'static str {
        match self {
            LockKind::Delete => "delete",
            LockKind::Write => "write",
            LockKind::Rebuild => "rebuild",
        }
    }
}

// == Lock Guard ==
/// An exclusively-held bucket lock, released on drop.
///
/// The guard owns the open anchor file; dropping it releases the advisory
/// lock on every exit path, including unwinds.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    kind: LockKind,
    bucket: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            debug!(
                "failed to release {} lock for bucket {}: {}",
                self.kind.label(),
                self.bucket,
                err
            );
        }
    }
}

// == Bucket Locks ==
/// Factory for per-bucket lock acquisition, probes and invalidation tokens.
#[derive(Debug, Clone)]
pub struct BucketLocks {
    root: PathBuf,
}

impl BucketLocks {
    // == Constructor ==
    /// Creates a lock factory over the given cache root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    // == Acquire Delete ==
    /// Acquires the bucket's delete lock, retrying until `timeout_ms`.
    ///
    /// Returns None on timeout or when the bucket directory cannot be
    /// created; callers treat that as "abort this operation".
    pub fn acquire_delete(&self, bucket: &str, timeout_ms: u64) -> Option<LockGuard> {
        self.acquire(bucket, LockKind::Delete, timeout_ms)
    }

    // == Acquire Write ==
    /// Acquires the bucket's write lock, retrying until `timeout_ms`.
    pub fn acquire_write(&self, bucket: &str, timeout_ms: u64) -> Option<LockGuard> {
        self.acquire(bucket, LockKind::Write, timeout_ms)
    }

    // == Acquire Rebuild ==
    /// Acquires the bucket's rebuild lock, retrying until `timeout_ms`.
    pub fn acquire_rebuild(&self, bucket: &str, timeout_ms: u64) -> Option<LockGuard> {
        self.acquire(bucket, LockKind::Rebuild, timeout_ms)
    }

    fn acquire(&self, bucket: &str, kind: LockKind, timeout_ms: u64) -> Option<LockGuard> {
        let dir = path::bucket_dir(&self.root, bucket);
        if let Err(err) = fs::create_dir_all(&dir) {
            debug!("cannot create bucket dir {}: {}", dir.display(), err);
            return None;
        }

        let anchor = dir.join(kind.anchor());
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            // Re-open on every attempt: the anchor may have been unlinked
            // externally, in which case a fresh one is created here.
            let file = match OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&anchor)
            {
                Ok(file) => file,
                Err(err) => {
                    debug!("cannot open lock anchor {}: {}", anchor.display(), err);
                    return None;
                }
            };

            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Some(LockGuard {
                        file,
                        kind,
                        bucket: bucket.to_string(),
                    })
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => {
                    debug!("lock attempt failed on {}: {}", anchor.display(), err);
                    return None;
                }
            }

            if Instant::now() >= deadline {
                debug!(
                    "timed out acquiring {} lock for bucket {} after {} ms",
                    kind.label(),
                    bucket,
                    timeout_ms
                );
                return None;
            }
            thread::sleep(ACQUIRE_BACKOFF);
        }
    }

    // == Check Delete ==
    /// Probes whether the bucket is free of an active delete.
    ///
    /// Returns true when no delete lock is held (safe to write). The probe
    /// opens the anchor read-only and takes a shared lock; it must never
    /// create or touch the file, since its mtime is the invalidation token.
    /// A missing anchor, or one that vanishes mid-probe, counts as safe.
    pub fn check_delete(&self, bucket: &str) -> bool {
        let anchor = self.delete_anchor(bucket);
        let file = match File::open(&anchor) {
            Ok(file) => file,
            Err(_) => return true,
        };
        match file.try_lock_shared() {
            Ok(()) => {
                let _ = file.unlock();
                true
            }
            Err(std::fs::TryLockError::WouldBlock) => false,
            Err(_) => true,
        }
    }

    // == Invalidation Token ==
    /// Returns the bucket's invalidation token: the `lock-delete` mtime in
    /// milliseconds since the epoch, or 0 when the anchor is absent.
    ///
    /// Never fails; any metadata error reads as 0.
    pub fn invalidation_token(&self, bucket: &str) -> u64 {
        let anchor = self.delete_anchor(bucket);
        fs::metadata(&anchor)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_millis() as u64)
            .unwrap_or(0)
    }

    // == Mark Invalidation ==
    /// Touches the `lock-delete` anchor so concurrent writers' token checks
    /// fail, creating the anchor if absent. Best-effort.
    pub fn mark_invalidation(&self, bucket: &str) {
        let dir = path::bucket_dir(&self.root, bucket);
        if let Err(err) = fs::create_dir_all(&dir) {
            debug!("cannot create bucket dir {}: {}", dir.display(), err);
            return;
        }
        let anchor = dir.join(LOCK_DELETE_FILE);
        let touched = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&anchor)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(err) = touched {
            debug!("cannot touch {}: {}", anchor.display(), err);
        }
    }

    fn delete_anchor(&self, bucket: &str) -> PathBuf {
        path::bucket_dir(&self.root, bucket).join(LOCK_DELETE_FILE)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn locks_in(dir: &Path) -> BucketLocks {
        BucketLocks::new(dir)
    }

    #[test]
    fn test_acquire_creates_bucket_and_anchor() {
        let root = tempdir().unwrap();
        let locks = locks_in(root.path());

        let guard = locks.acquire_write("orders", 50);
        assert!(guard.is_some());
        assert!(root.path().join("orders").join(LOCK_WRITE_FILE).exists());
    }

    #[test]
    fn test_second_acquire_times_out_while_held() {
        let root = tempdir().unwrap();
        let locks = locks_in(root.path());

        let _held = locks.acquire_write("orders", 50).unwrap();
        let started = Instant::now();
        assert!(locks.acquire_write("orders", 30).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_guard_drop_releases() {
        let root = tempdir().unwrap();
        let locks = locks_in(root.path());

        let guard = locks.acquire_delete("orders", 50).unwrap();
        drop(guard);
        assert!(locks.acquire_delete("orders", 50).is_some());
    }

    #[test]
    fn test_anchors_are_independent() {
        let root = tempdir().unwrap();
        let locks = locks_in(root.path());

        let _delete = locks.acquire_delete("orders", 50).unwrap();
        let _write = locks.acquire_write("orders", 50).unwrap();
        let _rebuild = locks.acquire_rebuild("orders", 50).unwrap();
    }

    #[test]
    fn test_check_delete_safe_when_absent() {
        let root = tempdir().unwrap();
        let locks = locks_in(root.path());

        assert!(locks.check_delete("nonexistent"));
        // The probe must not create the anchor
        assert!(!root
            .path()
            .join("nonexistent")
            .join(LOCK_DELETE_FILE)
            .exists());
    }

    #[test]
    fn test_check_delete_sees_active_deleter() {
        let root = tempdir().unwrap();
        let locks = locks_in(root.path());

        let guard = locks.acquire_delete("orders", 50).unwrap();
        assert!(!locks.check_delete("orders"));
        drop(guard);
        assert!(locks.check_delete("orders"));
    }

    #[test]
    fn test_invalidation_token_zero_when_absent() {
        let root = tempdir().unwrap();
        let locks = locks_in(root.path());

        assert_eq!(locks.invalidation_token("fresh-bucket"), 0);
    }

    #[test]
    fn test_mark_invalidation_advances_token() {
        let root = tempdir().unwrap();
        let locks = locks_in(root.path());

        locks.mark_invalidation("orders");
        let first = locks.invalidation_token("orders");
        assert!(first > 0);

        thread::sleep(Duration::from_millis(20));
        locks.mark_invalidation("orders");
        let second = locks.invalidation_token("orders");
        assert!(second >= first);
    }

    #[test]
    fn test_probe_does_not_move_token() {
        let root = tempdir().unwrap();
        let locks = locks_in(root.path());

        locks.mark_invalidation("orders");
        let before = locks.invalidation_token("orders");
        thread::sleep(Duration::from_millis(20));

        assert!(locks.check_delete("orders"));
        assert_eq!(locks.invalidation_token("orders"), before);
    }
}
