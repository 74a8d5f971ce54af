//! Key Path Module
//!
//! Maps dotted cache keys onto the on-disk directory tree.
//!
//! A key like `product.123.meta` becomes `<root>/product/123/meta/`; the
//! first segment (`product`) is the bucket, the unit of locking. Lookup is
//! O(1): the path is computed, never searched for.
//!
//! Keys are sanitized by stripping everything outside `[A-Za-z0-9._-]`, so
//! two keys differing only in stripped characters alias to the same
//! directory. This is documented behavior; hierarchical callers scope their
//! keys accordingly.

use std::path::{Path, PathBuf};

// == Sanitize ==
/// Strips characters outside `[A-Za-z0-9._-]` from a key.
pub fn sanitize(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

// == Segments ==
/// Splits a sanitized key on `.`, dropping empty segments.
pub fn segments(key: &str) -> Vec<String> {
    sanitize(key)
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// == Bucket ==
/// Returns the bucket (first segment) of a key, or None for a key that is
/// empty after sanitization.
pub fn bucket(key: &str) -> Option<String> {
    segments(key).into_iter().next()
}

// == Data Dir ==
/// Returns the key's data directory under `root`.
///
/// Returns None for a key that is empty after sanitization; callers treat
/// that as a silent no-op.
pub fn data_dir(root: &Path, key: &str) -> Option<PathBuf> {
    let segments = segments(key);
    if segments.is_empty() {
        return None;
    }
    let mut dir = root.to_path_buf();
    for segment in &segments {
        dir.push(segment);
    }
    Some(dir)
}

// == Bucket Dir ==
/// Returns the bucket directory (lock-anchor location) for a bucket name.
pub fn bucket_dir(root: &Path, bucket: &str) -> PathBuf {
    root.join(bucket)
}
