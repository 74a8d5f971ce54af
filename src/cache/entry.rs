//! Cache Entry Module
//!
//! Defines the on-disk naming scheme for cache entries.
//!
//! A key directory holds two tiers of payload files. Fresh entries are
//! named by their decimal expiry epoch (`1735689600`); stale entries carry
//! the `l1-` prefix (`l1-1735689600`) and serve as availability backups
//! while a key is being rebuilt. Transient publish files use a
//! `tmp_<pid>_<rand>` name and are renamed into place atomically.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

// == Naming Constants ==
/// Filename prefix of stale (backup) entries.
pub const STALE_PREFIX: &str = "l1-";
/// Filename prefix of transient publish files.
pub const TMP_PREFIX: &str = "tmp_";

// == Entry Slot ==
/// One payload file in a key directory: its location plus the expiry epoch
/// encoded in its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySlot {
    /// Full path of the payload file
    pub path: PathBuf,
    /// Expiry epoch in seconds, parsed from the filename
    pub epoch: u64,
}

impl EntrySlot {
    // == Is Fresh ==
    /// A slot is fresh while its expiry epoch has not passed.
    ///
    /// Boundary condition: an entry expiring exactly at `now` is still
    /// fresh; it turns stale one second later.
    pub fn is_fresh(&self, now: u64) -> bool {
        self.epoch >= now
    }

    /// Name this slot would carry after demotion to the stale tier.
    pub fn stale_name(&self) -> String {
        stale_name(self.epoch)
    }
}

// == Name Parsing ==
/// Parses a fresh-entry filename (all decimal digits) into its epoch.
pub fn parse_fresh_name(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Parses a stale-entry filename (`l1-<epoch>`) into its epoch.
pub fn parse_stale_name(name: &str) -> Option<u64> {
    parse_fresh_name(name.strip_prefix(STALE_PREFIX)?)
}

// == Name Formatting ==
/// Filename of a fresh entry expiring at `epoch`.
pub fn fresh_name(epoch: u64) -> String {
    epoch.to_string()
}

/// Filename of a stale entry that expired at `epoch`.
pub fn stale_name(epoch: u64) -> String {
    format!("{STALE_PREFIX}{epoch}")
}

// == Clock ==
/// Returns the current Unix epoch in seconds.
pub fn current_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_secs())
        .unwrap_or(0)
}
