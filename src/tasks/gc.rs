//! Garbage Collection Task
//!
//! Whole-cache sweep that demotes expired fresh entries to the stale tier
//! (zombie promotion) instead of destroying them, so a key whose TTL lapsed
//! can still serve degraded data while its next rebuild is in flight.
//!
//! GC runs on engine teardown, not per request, and is both time-gated and
//! single-flight across all processes sharing the tree: a `gc-control`
//! file at the cache root holds the last-run epoch and an exclusive lock
//! that at most one process can win. The stored epoch is rewritten before
//! the sweep starts, so a crashed sweep still holds the interval for
//! everyone else.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use chrono::{Local, Timelike};
use fs4::FileExt;
use tracing::{debug, info, warn};

use crate::cache::entry;
use crate::cache::files::{self, SweepMode, SweepOutcome};
use crate::config::Config;
use crate::lock::BucketLocks;

// == Control File ==
/// Single-flight anchor at the cache root; contains the last-run epoch as
/// an ASCII decimal string.
pub const GC_CONTROL_FILE: &str = "gc-control";

// == GC Summary ==
/// Tally of one completed sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcSummary {
    /// Buckets visited
    pub buckets: usize,
    /// Zombies promoted fresh → stale
    pub promoted: usize,
    /// Payload files removed
    pub removed: usize,
}

// == Run ==
/// Runs garbage collection if all gates pass.
///
/// Returns None when the run was skipped (never-expire mode, outside the
/// hour window, another GC in flight, or inside the minimum interval);
/// `force_gc` test mode bypasses the interval and hour gates only.
pub fn run(config: &Config, locks: &BucketLocks) -> Option<GcSummary> {
    if config.never_expire() {
        debug!("gc skipped: never-expire mode");
        return None;
    }
    if !config.force_gc() {
        let hour = Local::now().hour();
        if hour < config.gc_start_hour || hour > config.gc_end_hour {
            debug!(
                "gc skipped: hour {} outside window {}..={}",
                hour, config.gc_start_hour, config.gc_end_hour
            );
            return None;
        }
    }

    let control_path = config.cache_root.join(GC_CONTROL_FILE);
    let mut control = match OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&control_path)
    {
        Ok(file) => file,
        Err(err) => {
            warn!("gc cannot open {}: {}", control_path.display(), err);
            return None;
        }
    };
    match control.try_lock_exclusive() {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            debug!("gc skipped: another collection is in progress");
            return None;
        }
        Err(err) => {
            warn!("gc cannot lock {}: {}", control_path.display(), err);
            return None;
        }
    }

    let summary = run_locked(config, locks, &mut control);
    let _ = control.unlock();
    summary
}

fn run_locked(config: &Config, locks: &BucketLocks, control: &mut File) -> Option<GcSummary> {
    let now = entry::current_epoch();

    let mut stored = String::new();
    let _ = control.read_to_string(&mut stored);
    let last_run: u64 = stored.trim().parse().unwrap_or(0);
    if !config.force_gc() && now.saturating_sub(last_run) < config.gc_interval_secs {
        debug!(
            "gc skipped: last run {}s ago, interval {}s",
            now.saturating_sub(last_run),
            config.gc_interval_secs
        );
        return None;
    }

    // Stamp the run before sweeping: a failed sweep must still hold the
    // interval for every later attempt
    if let Err(err) = rewrite_epoch(control, now) {
        warn!("gc cannot stamp control file: {}", err);
    }

    let mut summary = GcSummary::default();
    let entries = match fs::read_dir(&config.cache_root) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("gc cannot list cache root: {}", err);
            return Some(summary);
        }
    };
    for dir_entry in entries.flatten() {
        let is_dir = dir_entry
            .file_type()
            .map(|kind| kind.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }
        let name = dir_entry.file_name();
        let Some(bucket) = name.to_str() else { continue };

        summary.buckets += 1;
        if let Some(outcome) = sweep_bucket(config, locks, bucket, &dir_entry.path(), now) {
            summary.promoted += outcome.promoted;
            summary.removed += outcome.removed;
        }
    }

    info!(
        "gc complete: {} buckets, {} promoted, {} removed",
        summary.buckets, summary.promoted, summary.removed
    );
    Some(summary)
}

fn rewrite_epoch(control: &mut File, epoch: u64) -> std::io::Result<()> {
    control.set_len(0)?;
    control.seek(SeekFrom::Start(0))?;
    control.write_all(epoch.to_string().as_bytes())?;
    control.flush()
}

// == Bucket Sweep ==
/// Takes the bucket's lock triplet in hierarchy order and performs zombie
/// promotion across its tree. Any failure is local to the bucket.
fn sweep_bucket(
    config: &Config,
    locks: &BucketLocks,
    bucket: &str,
    dir: &Path,
    now: u64,
) -> Option<SweepOutcome> {
    let Some(_delete_guard) = locks.acquire_delete(bucket, config.delete_lock_timeout_ms) else {
        debug!("gc: skipping bucket {} (delete lock unavailable)", bucket);
        return None;
    };

    locks.mark_invalidation(bucket);

    let Some(_write_guard) = locks.acquire_write(bucket, config.write_lock_timeout_ms) else {
        debug!("gc: skipping bucket {} (write lock unavailable)", bucket);
        return None;
    };

    // Best-effort: holding rebuild keeps readers-on-miss on the stale tier
    // during the swap, but the sweep is correct without it
    let _rebuild_guard = locks.acquire_rebuild(bucket, config.rebuild_lock_timeout_ms);

    let prune_empty = files::count_entries(dir) > config.dir_prune_threshold;
    Some(files::sweep_tree(dir, SweepMode::Expire(now), prune_empty))
}
