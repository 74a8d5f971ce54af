//! Integration Tests for the Cache Store
//!
//! End-to-end concurrency scenarios. Each worker thread opens its own
//! `CacheStore` over the shared root, exactly as independent processes
//! would: engines share no in-process state, so all coordination runs
//! through the advisory lock anchors on disk.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tempfile::tempdir;

use stratacache::lock::BucketLocks;
use stratacache::{CacheStore, Config, TestMode};

// == Helper Functions ==

/// Routes the engine's tracing output into the test harness; `RUST_LOG`
/// controls verbosity when a scenario needs debugging.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn open_store(root: &Path) -> CacheStore {
    CacheStore::new(Config::new(root)).unwrap()
}

/// Seeds a payload file encoded the way `set` publishes it.
fn seed_payload(dir: &Path, name: &str, value: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(name), serde_json::to_vec(value).unwrap()).unwrap();
}

/// Names of fresh (all-digit) files directly in `dir`.
fn fresh_names(dir: &Path) -> Vec<String> {
    list_names(dir, |name| name.bytes().all(|b| b.is_ascii_digit()))
}

/// Names of stale (`l1-` prefixed) files directly in `dir`.
fn stale_names(dir: &Path) -> Vec<String> {
    list_names(dir, |name| name.starts_with("l1-"))
}

fn list_names(dir: &Path, keep: fn(&str) -> bool) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| !name.is_empty() && keep(name))
        .collect()
}

/// Counts payload files (fresh or stale) anywhere under `dir`.
fn payload_count(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut count = 0;
    for dir_entry in entries.flatten() {
        let path = dir_entry.path();
        if path.is_dir() {
            count += payload_count(&path);
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            let is_fresh = !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit());
            if is_fresh || name.starts_with("l1-") {
                count += 1;
            }
        }
    }
    count
}

// == Scenario: Thundering Herd on a Stale Bucket ==
// A bucket holding only a stale backup is hit by ten concurrent readers.
// At most a couple win the rebuild lock and are told to rebuild; everyone
// else is served the stale payload, and nobody stalls.

#[test]
fn test_thundering_herd_on_stale_bucket() {
    init_tracing();
    let root = tempdir().unwrap();
    let dir = root.path().join("herd");
    seed_payload(&dir, &format!("l1-{}", now_epoch() - 5000), "STALE_DATA_L1");

    let barrier = Arc::new(Barrier::new(10));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let barrier = Arc::clone(&barrier);
        let root = root.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let mut store = open_store(&root);
            barrier.wait();
            let started = Instant::now();
            let value: Option<String> = store.get("herd");
            (value, started.elapsed())
        }));
    }

    let results: Vec<(Option<String>, Duration)> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    let rebuilders = results.iter().filter(|(v, _)| v.is_none()).count();
    let stale_served = results
        .iter()
        .filter(|(v, _)| v.as_deref() == Some("STALE_DATA_L1"))
        .count();

    assert!(rebuilders <= 2, "got {rebuilders} rebuilders, expected 0-2");
    assert!(stale_served >= 8, "got {stale_served} stale hits, expected >= 8");
    for (_, elapsed) in &results {
        assert!(
            *elapsed < Duration::from_millis(250),
            "a reader stalled for {elapsed:?}"
        );
    }
}

// == Scenario: Delete Blocks Write ==
// While another worker holds the bucket's delete lock, a writer must abort
// quickly and publish nothing.

#[test]
fn test_delete_lock_blocks_writer() {
    init_tracing();
    let root = tempdir().unwrap();
    let root_path = root.path().to_path_buf();

    let holder = thread::spawn(move || {
        let locks = BucketLocks::new(&root_path);
        let guard = locks.acquire_delete("blocked_key", 1000).unwrap();
        thread::sleep(Duration::from_secs(3));
        drop(guard);
    });

    thread::sleep(Duration::from_secs(1));
    let mut store = open_store(root.path());
    let started = Instant::now();
    store.set("blocked_key", &"x".to_string(), 0);
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(500),
        "writer took {elapsed:?} to abort"
    );
    let dir = root.path().join("blocked_key");
    assert!(
        fresh_names(&dir).is_empty(),
        "aborted writer must not publish"
    );

    holder.join().unwrap();
    assert!(fresh_names(&dir).is_empty());
}

// == Scenario: Sniper Race ==
// A writer captures its invalidation token, then stalls (lag_set_init). A
// delete lands in the gap. The writer's token re-check must kill the
// publication: its value was computed against pre-invalidation state.

#[test]
fn test_sniper_race_aborts_lagged_writer() {
    init_tracing();
    let root = tempdir().unwrap();

    let mut lag_config = Config::new(root.path());
    lag_config.test_mode = Some(TestMode::LagSetInit);
    let mut lagged_writer = CacheStore::new(lag_config).unwrap();

    let writer = thread::spawn(move || {
        lagged_writer.set("race_key", &"STALE".to_string(), 0);
        lagged_writer.stats()
    });

    thread::sleep(Duration::from_secs(1));
    let mut sniper = open_store(root.path());
    sniper.delete("race_key");

    let writer_stats = writer.join().unwrap();
    assert_eq!(writer_stats.aborted_writes, 1);

    let dir = root.path().join("race_key");
    assert!(
        fresh_names(&dir).is_empty(),
        "lagged writer must not publish a fresh entry"
    );
    assert!(
        stale_names(&dir).is_empty(),
        "the key was never populated, so the delete path promotes nothing"
    );
}

// == Scenario: Zombie Promotion ==
// A key whose only fresh entry expired an hour ago is demoted, not
// destroyed, by the teardown GC pass.

#[test]
fn test_zombie_promotion_on_shutdown() {
    init_tracing();
    let root = tempdir().unwrap();
    let dir = root.path().join("gc_zombie_test");
    let expired = now_epoch() - 3600;
    seed_payload(&dir, &expired.to_string(), "I AM A ZOMBIE");

    let mut config = Config::new(root.path());
    config.test_mode = Some(TestMode::ForceGc);
    let mut store = CacheStore::new(config).unwrap();
    store.shutdown();

    assert!(!dir.join(expired.to_string()).exists());
    let promoted = dir.join(format!("l1-{expired}"));
    assert!(promoted.exists());
    let preserved: String =
        serde_json::from_str(&fs::read_to_string(promoted).unwrap()).unwrap();
    assert_eq!(
        preserved, "I AM A ZOMBIE",
        "promotion must preserve the payload"
    );
}

// == Scenario: Warm Fan-Out ==
// Twenty concurrent readers of a valid fresh entry all hit, touch no lock
// and create nothing.

#[test]
fn test_warm_fresh_fan_out() {
    init_tracing();
    let root = tempdir().unwrap();
    let dir = root.path().join("warm_l2");
    seed_payload(&dir, &(now_epoch() + 3600).to_string(), "FRESH_L2_DATA");

    let barrier = Arc::new(Barrier::new(20));
    let mut handles = Vec::new();
    for _ in 0..20 {
        let barrier = Arc::clone(&barrier);
        let root = root.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let mut store = open_store(&root);
            barrier.wait();
            store.get::<String>("warm_l2")
        }));
    }

    for handle in handles {
        assert_eq!(handle.join().unwrap().as_deref(), Some("FRESH_L2_DATA"));
    }
    assert!(
        stale_names(&dir).is_empty(),
        "reads must not create stale backups"
    );
    assert!(
        !dir.join("lock-rebuild").exists(),
        "fresh reads must not touch any lock anchor"
    );
}

// == Scenario: Cold Fan-Out ==
// Twenty concurrent readers of a key that never existed all miss, and the
// read path creates no payload files.

#[test]
fn test_cold_fan_out_creates_nothing() {
    init_tracing();
    let root = tempdir().unwrap();

    let barrier = Arc::new(Barrier::new(20));
    let mut handles = Vec::new();
    for _ in 0..20 {
        let barrier = Arc::clone(&barrier);
        let root = root.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let mut store = open_store(&root);
            barrier.wait();
            store.get::<String>("cold_single_key")
        }));
    }

    for handle in handles {
        assert!(handle.join().unwrap().is_none());
    }
    assert_eq!(
        payload_count(root.path()),
        0,
        "misses must not create payload files"
    );
}

// == Scenario: Rebuild Cycle ==
// The full lifecycle a web worker drives: populate, invalidate, get told
// to rebuild, republish, serve the new value.

#[test]
fn test_invalidation_then_rebuild_cycle() {
    init_tracing();
    let root = tempdir().unwrap();
    let mut store = open_store(root.path());

    store.set("catalog.42", &"v1".to_string(), 0);
    assert_eq!(
        store.get::<String>("catalog.42").as_deref(),
        Some("v1")
    );

    store.delete("catalog.42");

    // First reader after the invalidation wins the rebuild lock and is
    // told to rebuild
    assert!(store.get::<String>("catalog.42").is_none());

    store.set("catalog.42", &"v2".to_string(), 0);
    assert_eq!(
        store.get::<String>("catalog.42").as_deref(),
        Some("v2")
    );

    // The old value never reappears
    let dir = root.path().join("catalog").join("42");
    assert_eq!(fresh_names(&dir).len(), 1);
}

// == Scenario: Racing Writers ==
// Two writers racing on one key leave exactly one fresh entry holding one
// of the two values.

#[test]
fn test_racing_writers_leave_one_fresh_entry() {
    init_tracing();
    let root = tempdir().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for value in ["left", "right"] {
        let barrier = Arc::clone(&barrier);
        let root = root.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let mut store = open_store(&root);
            barrier.wait();
            store.set("contended.key", &value.to_string(), 0);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let dir = root.path().join("contended").join("key");
    assert_eq!(fresh_names(&dir).len(), 1);

    let mut reader = open_store(root.path());
    let value: Option<String> = reader.get("contended.key");
    assert!(
        matches!(value.as_deref(), Some("left") | Some("right")),
        "got {value:?}"
    );
}
