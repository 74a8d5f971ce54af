//! Entry File Operations
//!
//! Low-level file operations within key directories: listing the two entry
//! tiers, decode-tolerant reads, atomic publication, fresh→stale promotion
//! and the recursive sweep shared by delete, purge and garbage collection.
//!
//! Every function here is race-tolerant. Files listed a moment ago may be
//! gone by the time they are read or removed; third parties deleting cache
//! files out from under the engine is an expected chaos event, not an
//! error.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use rand::Rng;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cache::entry::{self, EntrySlot, TMP_PREFIX};
use crate::error::{CacheError, Result};

// == Listing ==
/// Lists fresh entries (all-digit names) in a directory, newest first.
pub fn list_fresh(dir: &Path) -> Vec<EntrySlot> {
    list_by(dir, entry::parse_fresh_name)
}

/// Lists stale entries (`l1-` prefixed names) in a directory, newest first.
pub fn list_stale(dir: &Path) -> Vec<EntrySlot> {
    list_by(dir, entry::parse_stale_name)
}

fn list_by(dir: &Path, parse: fn(&str) -> Option<u64>) -> Vec<EntrySlot> {
    let mut slots = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return slots,
    };
    for dir_entry in entries.flatten() {
        let name = dir_entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(epoch) = parse(name) else { continue };
        let is_file = dir_entry
            .file_type()
            .map(|kind| kind.is_file())
            .unwrap_or(false);
        if is_file {
            slots.push(EntrySlot {
                path: dir_entry.path(),
                epoch,
            });
        }
    }
    slots.sort_by(|a, b| b.epoch.cmp(&a.epoch));
    slots
}

// == Read ==
/// Reads and decodes a payload file.
///
/// Returns None on any I/O or decode failure; an undecodable file is a
/// miss, never an error, and is left in place for GC to demote later.
pub fn read_payload<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!("undecodable payload at {}: {}", path.display(), err);
            None
        }
    }
}

// == Publish ==
/// Atomically publishes a payload as the fresh entry expiring at `epoch`.
///
/// Writes to `tmp_<pid>_<rand>` in the same directory, renames it to the
/// epoch filename, then refreshes the stale backup with a copy. A failed
/// rename unlinks the temp file and reports failure; a failed backup copy
/// only degrades availability and is logged.
pub fn publish(dir: &Path, epoch: u64, payload: &[u8]) -> Result<()> {
    fs::create_dir_all(dir).map_err(|err| CacheError::io(dir, err))?;

    let tmp = dir.join(format!(
        "{TMP_PREFIX}{}_{}",
        process::id(),
        rand::thread_rng().gen::<u32>()
    ));
    fs::write(&tmp, payload).map_err(|err| CacheError::io(&tmp, err))?;

    let fresh = dir.join(entry::fresh_name(epoch));
    if let Err(err) = fs::rename(&tmp, &fresh) {
        let _ = fs::remove_file(&tmp);
        return Err(CacheError::io(&fresh, err));
    }

    let stale = dir.join(entry::stale_name(epoch));
    if let Err(err) = fs::copy(&fresh, &stale) {
        debug!("could not refresh stale backup {}: {}", stale.display(), err);
    }
    Ok(())
}

// == Promote ==
/// Demotes a fresh entry to the stale tier by rename.
///
/// When the rename fails the original is unlinked instead: the payload is
/// lost but the directory never retains an expired fresh entry. Returns
/// true when the stale file exists afterwards.
pub fn promote_to_stale(slot: &EntrySlot) -> bool {
    let target = slot.path.with_file_name(slot.stale_name());
    match fs::rename(&slot.path, &target) {
        Ok(()) => true,
        Err(err) => {
            debug!(
                "promotion rename {} -> {} failed: {}",
                slot.path.display(),
                target.display(),
                err
            );
            let _ = fs::remove_file(&slot.path);
            false
        }
    }
}

// == Prune ==
/// Removes all but the newest `keep` entries from a newest-first list.
/// Returns the number of files actually removed.
pub fn prune_older(slots: &[EntrySlot], keep: usize) -> usize {
    let mut removed = 0;
    for slot in slots.iter().skip(keep) {
        match fs::remove_file(&slot.path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => debug!("could not prune {}: {}", slot.path.display(), err),
        }
    }
    removed
}

// == Sweep ==
/// What a recursive sweep does to each visited directory.
#[derive(Debug, Clone, Copy)]
pub enum SweepMode {
    /// Targeted invalidation: demote the newest fresh entry to the stale
    /// tier, discarding older siblings and previous backups.
    Invalidate,
    /// Garbage collection at the given epoch: demote the newest fresh entry
    /// only when it has expired, otherwise just prune siblings.
    Expire(u64),
    /// Destructive removal of every payload in both tiers.
    Purge,
}

/// Tally of a sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepOutcome {
    /// Entries demoted fresh → stale
    pub promoted: usize,
    /// Payload files removed
    pub removed: usize,
}

/// Depth-first sweep of a directory tree.
///
/// Visits children before parents. When `prune_empty` is set, emptied
/// sub-directories are removed on the way back up; the top-level `dir`
/// itself is always preserved.
pub fn sweep_tree(dir: &Path, mode: SweepMode, prune_empty: bool) -> SweepOutcome {
    let mut outcome = SweepOutcome::default();
    sweep_walk(dir, mode, prune_empty, &mut outcome);
    outcome
}

fn sweep_walk(dir: &Path, mode: SweepMode, prune_empty: bool, outcome: &mut SweepOutcome) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let subdirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_type().map(|kind| kind.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();

    for sub in subdirs {
        sweep_walk(&sub, mode, prune_empty, outcome);
        if prune_empty {
            // Succeeds only once the subtree is empty
            let _ = fs::remove_dir(&sub);
        }
    }
    sweep_dir(dir, mode, outcome);
}

fn sweep_dir(dir: &Path, mode: SweepMode, outcome: &mut SweepOutcome) {
    let fresh = list_fresh(dir);
    let stale = list_stale(dir);

    match mode {
        SweepMode::Purge => {
            outcome.removed += prune_older(&fresh, 0);
            outcome.removed += prune_older(&stale, 0);
        }
        SweepMode::Invalidate => {
            if let Some(newest) = fresh.first() {
                // Previous backups go first so they cannot shadow or collide
                // with the entry about to take their tier
                outcome.removed += prune_older(&stale, 0);
                if promote_to_stale(newest) {
                    outcome.promoted += 1;
                }
                outcome.removed += prune_older(&fresh, 1);
            } else {
                outcome.removed += prune_older(&stale, 1);
            }
        }
        SweepMode::Expire(now) => {
            outcome.removed += prune_older(&fresh, 1);
            match fresh.first() {
                Some(newest) if !newest.is_fresh(now) => {
                    outcome.removed += prune_older(&stale, 0);
                    if promote_to_stale(newest) {
                        outcome.promoted += 1;
                    }
                }
                _ => {
                    outcome.removed += prune_older(&stale, 1);
                }
            }
        }
    }
}

// == Entry Count ==
/// Counts files in a directory tree. Used by GC to decide whether a bucket
/// is large enough to warrant empty-directory pruning.
pub fn count_entries(dir: &Path) -> usize {
    let mut count = 0;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    for dir_entry in entries.flatten() {
        match dir_entry.file_type() {
            Ok(kind) if kind.is_dir() => count += count_entries(&dir_entry.path()),
            Ok(kind) if kind.is_file() => count += 1,
            _ => {}
        }
    }
    count
}
