//! Configuration Module
//!
//! Handles loading and managing engine configuration from environment variables.

use std::env;
use std::path::PathBuf;

// == Constants ==
/// TTL sentinel meaning "never expire".
///
/// When the default TTL equals this value, `get` skips the expiry filter and
/// `shutdown` skips garbage collection entirely. The literal is kept for
/// on-disk compatibility with existing deployments.
pub const NEVER_EXPIRE_TTL_SECS: u64 = 3601;

// == Test Mode ==
/// Fault-injection modes used by the stress harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// Injects a 3 second sleep inside `set` right after the invalidation
    /// token is captured, widening the window for a concurrent delete.
    LagSetInit,
    /// Bypasses the GC interval and hour-window gates.
    ForceGc,
}

impl TestMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "lag_set_init" => Some(TestMode::LagSetInit),
            "force_gc" => Some(TestMode::ForceGc),
            _ => None,
        }
    }
}

// == Config ==
/// Engine configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the cache tree
    pub cache_root: PathBuf,
    /// Default TTL in seconds for entries without explicit TTL
    pub default_ttl_secs: u64,
    /// Minimum seconds between garbage collection runs
    pub gc_interval_secs: u64,
    /// First hour of day (inclusive) in which GC may run
    pub gc_start_hour: u32,
    /// Last hour of day (inclusive) in which GC may run
    pub gc_end_hour: u32,
    /// Rebuild-lock acquire timeout in milliseconds
    pub rebuild_lock_timeout_ms: u64,
    /// Write-lock acquire timeout in milliseconds
    pub write_lock_timeout_ms: u64,
    /// Delete-lock acquire timeout in milliseconds
    pub delete_lock_timeout_ms: u64,
    /// How long a miss holds the rebuild lock, in microseconds.
    /// Rate-limits concurrent rebuilds to one per window per bucket.
    pub get_grace_delay_us: u64,
    /// Fresh files tolerated in a key directory during `set` before the
    /// siblings are pruned
    pub max_stale_files: usize,
    /// Bucket entry count above which GC may remove emptied sub-directories
    pub dir_prune_threshold: usize,
    /// Optional fault-injection mode
    pub test_mode: Option<TestMode>,
}

impl Config {
    // == Constructor ==
    /// Creates a Config rooted at `cache_root` with default tunables.
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Self::default()
        }
    }

    /// Creates a Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `STRATACACHE_ROOT` - Cache root directory (default: `./cache`)
    /// - `STRATACACHE_TTL` - Default TTL in seconds (default: 3600)
    /// - `STRATACACHE_GC_INTERVAL` - Seconds between GC runs (default: 43200)
    /// - `STRATACACHE_GC_START_HOUR` / `STRATACACHE_GC_END_HOUR` - Inclusive
    ///   hour window for GC (defaults: 0 / 6)
    /// - `STRATACACHE_REBUILD_TIMEOUT_MS` - Rebuild-lock timeout (default: 10)
    /// - `STRATACACHE_WRITE_TIMEOUT_MS` - Write-lock timeout (default: 100)
    /// - `STRATACACHE_DELETE_TIMEOUT_MS` - Delete-lock timeout (default: 60000)
    /// - `STRATACACHE_GRACE_DELAY_US` - Rebuild-lock hold time (default: 20000)
    /// - `STRATACACHE_MAX_STALE_FILES` - Fresh-file retention threshold (default: 1)
    /// - `STRATACACHE_DIR_PRUNE_THRESHOLD` - GC directory-prune threshold (default: 15000)
    /// - `STRATACACHE_TEST_MODE` - `lag_set_init` or `force_gc` (default: unset)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_root: env::var("STRATACACHE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_root),
            default_ttl_secs: env_parse("STRATACACHE_TTL", defaults.default_ttl_secs),
            gc_interval_secs: env_parse("STRATACACHE_GC_INTERVAL", defaults.gc_interval_secs),
            gc_start_hour: env_parse("STRATACACHE_GC_START_HOUR", defaults.gc_start_hour),
            gc_end_hour: env_parse("STRATACACHE_GC_END_HOUR", defaults.gc_end_hour),
            rebuild_lock_timeout_ms: env_parse(
                "STRATACACHE_REBUILD_TIMEOUT_MS",
                defaults.rebuild_lock_timeout_ms,
            ),
            write_lock_timeout_ms: env_parse(
                "STRATACACHE_WRITE_TIMEOUT_MS",
                defaults.write_lock_timeout_ms,
            ),
            delete_lock_timeout_ms: env_parse(
                "STRATACACHE_DELETE_TIMEOUT_MS",
                defaults.delete_lock_timeout_ms,
            ),
            get_grace_delay_us: env_parse(
                "STRATACACHE_GRACE_DELAY_US",
                defaults.get_grace_delay_us,
            ),
            max_stale_files: env_parse("STRATACACHE_MAX_STALE_FILES", defaults.max_stale_files),
            dir_prune_threshold: env_parse(
                "STRATACACHE_DIR_PRUNE_THRESHOLD",
                defaults.dir_prune_threshold,
            ),
            test_mode: env::var("STRATACACHE_TEST_MODE")
                .ok()
                .and_then(|v| TestMode::parse(&v)),
        }
    }

    // == Never Expire ==
    /// Returns true when the TTL-skip sentinel is active: entries never
    /// expire and garbage collection is disabled.
    pub fn never_expire(&self) -> bool {
        self.default_ttl_secs == NEVER_EXPIRE_TTL_SECS
    }

    // == Force GC ==
    /// Returns true when the `force_gc` fault-injection mode is active.
    pub fn force_gc(&self) -> bool {
        self.test_mode == Some(TestMode::ForceGc)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("cache"),
            default_ttl_secs: 3600,
            gc_interval_secs: 43_200,
            gc_start_hour: 0,
            gc_end_hour: 6,
            rebuild_lock_timeout_ms: 10,
            write_lock_timeout_ms: 100,
            delete_lock_timeout_ms: 60_000,
            get_grace_delay_us: 20_000,
            max_stale_files: 1,
            dir_prune_threshold: 15_000,
            test_mode: None,
        }
    }
}

// == Env Helpers ==
fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.default_ttl_secs, 3600);
        assert_eq!(config.gc_interval_secs, 43_200);
        assert_eq!(config.gc_start_hour, 0);
        assert_eq!(config.gc_end_hour, 6);
        assert_eq!(config.rebuild_lock_timeout_ms, 10);
        assert_eq!(config.write_lock_timeout_ms, 100);
        assert_eq!(config.delete_lock_timeout_ms, 60_000);
        assert_eq!(config.get_grace_delay_us, 20_000);
        assert_eq!(config.max_stale_files, 1);
        assert_eq!(config.dir_prune_threshold, 15_000);
        assert!(config.test_mode.is_none());
        assert!(!config.never_expire());
    }

    #[test]
    fn test_config_new_sets_root() {
        let config = Config::new("/tmp/cache-root");
        assert_eq!(config.cache_root, PathBuf::from("/tmp/cache-root"));
        assert_eq!(config.default_ttl_secs, 3600);
    }

    #[test]
    fn test_never_expire_sentinel() {
        let mut config = Config::default();
        assert!(!config.never_expire());

        config.default_ttl_secs = NEVER_EXPIRE_TTL_SECS;
        assert!(config.never_expire());

        // One past the sentinel is an ordinary TTL again
        config.default_ttl_secs = NEVER_EXPIRE_TTL_SECS + 1;
        assert!(!config.never_expire());
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        env::remove_var("STRATACACHE_TTL");
        env::remove_var("STRATACACHE_GC_INTERVAL");
        env::remove_var("STRATACACHE_TEST_MODE");

        let config = Config::from_env();
        assert_eq!(config.default_ttl_secs, 3600);
        assert_eq!(config.gc_interval_secs, 43_200);
        assert!(config.test_mode.is_none());
    }

    #[test]
    fn test_test_mode_parse() {
        assert_eq!(TestMode::parse("lag_set_init"), Some(TestMode::LagSetInit));
        assert_eq!(TestMode::parse("force_gc"), Some(TestMode::ForceGc));
        assert_eq!(TestMode::parse("bogus"), None);
    }
}
