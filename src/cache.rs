//! Content-addressed dependency cache.
//!
//! Installed dependency trees are snapshotted under a fingerprint computed
//! from the normalized spec set; later sandboxes with the same fingerprint
//! skip the install and rehydrate the snapshot by hardlink-copy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::CacheConfig;
use crate::errors::{PactownError, Result};
use crate::runtime::{RuntimeKind, driver_for};

/// Bumped whenever the snapshot layout changes; old entries then miss
/// naturally instead of needing migration.
pub const CACHE_VERSION: u32 = 2;

const META_FILE: &str = "meta.json";

/// Deterministic identifier for a dependency set.
///
/// Specifiers are trimmed, case-folded, and sorted before hashing, so line
/// order and stray whitespace in the source block do not change the result.
/// The empty set hashes the bare `runtime|version|` prefix, which cannot
/// collide with any non-empty set.
pub fn fingerprint(runtime: RuntimeKind, specs: &[String]) -> String {
    let mut normalized: Vec<String> = specs
        .iter()
        .map(|spec| spec.trim().to_ascii_lowercase())
        .filter(|spec| !spec.is_empty() && !spec.starts_with('#'))
        .collect();
    normalized.sort();
    normalized.dedup();

    let payload = format!(
        "{}|{}|{}",
        runtime.as_str(),
        CACHE_VERSION,
        normalized.join("\n")
    );
    blake3::hash(payload.as_bytes()).to_hex().to_string()
}

/// One materialized snapshot on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedEnv {
    pub fingerprint: String,
    pub runtime: RuntimeKind,
    pub created_at: DateTime<Utc>,
    pub last_hit: DateTime<Utc>,
    pub size_bytes: u64,
    #[serde(default)]
    pub ref_count: u32,
    #[serde(skip)]
    pub root_path: PathBuf,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub enabled: bool,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
}

/// Process-wide cache over a shared on-disk root.
///
/// The per-fingerprint async lock is the only serialization primitive:
/// concurrent installs for the same fingerprint queue on it, and the loser
/// observes a hit once unblocked.
pub struct DependencyCache {
    root: PathBuf,
    config: CacheConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    counters: Mutex<Counters>,
}

impl DependencyCache {
    pub fn new(config: CacheConfig) -> Self {
        let root = config.resolved_root();
        Self {
            root,
            config,
            locks: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The fingerprint-scoped lock; hold it across consult → install →
    /// publish so a racing install for the same set serializes.
    pub fn lock_for(&self, fingerprint: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn entry_dir(&self, runtime: RuntimeKind, fingerprint: &str) -> PathBuf {
        self.root.join(runtime.as_str()).join(fingerprint)
    }

    /// Look up a snapshot. A hit requires the entry directory to exist and
    /// to contain the runtime's marker tree; anything else quarantines the
    /// entry and reports a miss.
    pub fn get_cached(&self, runtime: RuntimeKind, fingerprint: &str) -> Option<CachedEnv> {
        if !self.config.enabled {
            return None;
        }
        let dir = self.entry_dir(runtime, fingerprint);
        if !dir.is_dir() {
            self.count_miss();
            return None;
        }

        let marker_ok = driver_for(runtime)
            .map(|driver| driver.has_installed_marker(&dir))
            .unwrap_or(false);
        if !marker_ok {
            log::warn!("cache entry {fingerprint} has no marker tree; quarantining");
            self.quarantine(runtime, &dir);
            self.count_miss();
            return None;
        }

        let mut entry = match self.read_meta(&dir) {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("cache entry {fingerprint} metadata unreadable ({err}); quarantining");
                self.quarantine(runtime, &dir);
                self.count_miss();
                return None;
            }
        };

        entry.last_hit = Utc::now();
        entry.root_path = dir.clone();
        if let Err(err) = self.write_meta(&dir, &entry) {
            log::debug!("could not refresh last-hit time for {fingerprint}: {err}");
        }
        {
            let mut counters = self.counters.lock().expect("counter lock poisoned");
            counters.hits += 1;
        }
        log::debug!("cache hit for {runtime} fingerprint {fingerprint}");
        Some(entry)
    }

    /// Snapshot the installed tree from `sandbox` under `fingerprint`.
    ///
    /// The copy is staged into a sibling directory and renamed into place,
    /// so a crash mid-snapshot never shows up as a cache hit. Losing a
    /// publish race is not an error; the winner's entry is returned.
    pub fn store(
        &self,
        runtime: RuntimeKind,
        fingerprint: &str,
        sandbox: &Path,
    ) -> Result<CachedEnv> {
        let driver = driver_for(runtime).ok_or_else(|| PactownError::CacheCorruption {
            fingerprint: fingerprint.into(),
            message: format!("no driver for runtime {runtime}"),
        })?;

        let runtime_dir = self.root.join(runtime.as_str());
        std::fs::create_dir_all(&runtime_dir).map_err(|e| PactownError::io(&runtime_dir, e))?;

        let staging = runtime_dir.join(format!(
            ".staging-{fingerprint}-{}",
            Utc::now().timestamp_micros()
        ));
        std::fs::create_dir_all(&staging).map_err(|e| PactownError::io(&staging, e))?;

        let mut size_bytes = 0;
        for subtree in driver.cache_subtrees() {
            let src = sandbox.join(subtree);
            if src.exists() {
                size_bytes += hardlink_copy_tree(&src, &staging.join(subtree))?;
            }
        }

        let now = Utc::now();
        let entry = CachedEnv {
            fingerprint: fingerprint.to_string(),
            runtime,
            created_at: now,
            last_hit: now,
            size_bytes,
            ref_count: 0,
            root_path: PathBuf::new(),
        };
        self.write_meta(&staging, &entry)?;
        fsync_dir(&staging);

        let final_dir = self.entry_dir(runtime, fingerprint);
        match std::fs::rename(&staging, &final_dir) {
            Ok(()) => {}
            Err(_) if final_dir.is_dir() => {
                // Lost the publish race; keep the winner.
                let _ = std::fs::remove_dir_all(&staging);
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(PactownError::io(&final_dir, e));
            }
        }

        self.evict_if_needed();

        let mut stored = self.read_meta(&final_dir)?;
        stored.root_path = final_dir;
        Ok(stored)
    }

    /// Materialize a snapshot into the sandbox by hardlink-copy, overwriting
    /// leftovers from prior runs. Falls back to byte copies when linking
    /// fails (cross-device, permissions).
    pub fn rehydrate(&self, entry: &CachedEnv, sandbox: &Path) -> Result<()> {
        let dir = &entry.root_path;
        let listing = std::fs::read_dir(dir).map_err(|e| PactownError::io(dir, e))?;
        for child in listing {
            let child = child.map_err(|e| PactownError::io(dir, e))?;
            let name = child.file_name();
            if name.to_string_lossy() == META_FILE {
                continue;
            }
            hardlink_copy_tree(&child.path(), &sandbox.join(&name))?;
        }
        Ok(())
    }

    /// Pin an entry against eviction; paired with `release`.
    pub fn retain(&self, runtime: RuntimeKind, fingerprint: &str) -> Result<()> {
        self.adjust_ref(runtime, fingerprint, 1)
    }

    pub fn release(&self, runtime: RuntimeKind, fingerprint: &str) -> Result<()> {
        self.adjust_ref(runtime, fingerprint, -1)
    }

    fn adjust_ref(&self, runtime: RuntimeKind, fingerprint: &str, delta: i64) -> Result<()> {
        let dir = self.entry_dir(runtime, fingerprint);
        let mut entry = self.read_meta(&dir)?;
        entry.ref_count = (i64::from(entry.ref_count) + delta).max(0) as u32;
        self.write_meta(&dir, &entry)
    }

    /// Drop least-recently-hit entries until both configured bounds hold.
    /// Entries with a nonzero ref_count are never deleted, and neither is
    /// the most recently hit entry (the one a store just published).
    pub fn evict_if_needed(&self) {
        let mut entries = self.entries();
        if entries.len() <= 1 {
            return;
        }
        entries.sort_by_key(|entry| entry.last_hit);

        let mut count = entries.len();
        let mut total: u64 = entries.iter().map(|e| e.size_bytes).sum();
        entries.pop();

        for entry in entries {
            if count <= self.config.max_entries && total <= self.config.max_total_bytes {
                break;
            }
            if entry.ref_count > 0 {
                continue;
            }
            log::debug!(
                "evicting cache entry {} ({} bytes, last hit {})",
                entry.fingerprint,
                entry.size_bytes,
                entry.last_hit
            );
            let _ = std::fs::remove_dir_all(&entry.root_path);
            count -= 1;
            total = total.saturating_sub(entry.size_bytes);
        }
    }

    /// Remove every unreferenced entry; returns how many were deleted.
    pub fn purge(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in self.entries() {
            if entry.ref_count > 0 {
                continue;
            }
            std::fs::remove_dir_all(&entry.root_path)
                .map_err(|e| PactownError::io(&entry.root_path, e))?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries();
        let counters = self.counters.lock().expect("counter lock poisoned");
        CacheStats {
            entries: entries.len(),
            total_bytes: entries.iter().map(|e| e.size_bytes).sum(),
            hits: counters.hits,
            misses: counters.misses,
            enabled: self.config.enabled,
        }
    }

    fn entries(&self) -> Vec<CachedEnv> {
        let mut entries = Vec::new();
        let Ok(runtimes) = std::fs::read_dir(&self.root) else {
            return entries;
        };
        for runtime_dir in runtimes.flatten() {
            let Ok(listing) = std::fs::read_dir(runtime_dir.path()) else {
                continue;
            };
            for child in listing.flatten() {
                let name = child.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let dir = child.path();
                if let Ok(mut entry) = self.read_meta(&dir) {
                    entry.root_path = dir;
                    entries.push(entry);
                }
            }
        }
        entries
    }

    fn read_meta(&self, dir: &Path) -> Result<CachedEnv> {
        let path = dir.join(META_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| PactownError::io(&path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_meta(&self, dir: &Path, entry: &CachedEnv) -> Result<()> {
        let path = dir.join(META_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(entry)?)
            .map_err(|e| PactownError::io(&path, e))
    }

    fn quarantine(&self, runtime: RuntimeKind, dir: &Path) {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let dest = self.root.join(runtime.as_str()).join(format!(
            ".quarantine-{name}-{}",
            Utc::now().timestamp_micros()
        ));
        if let Err(err) = std::fs::rename(dir, &dest) {
            log::warn!("could not quarantine {}: {err}", dir.display());
        }
    }

    fn count_miss(&self) {
        let mut counters = self.counters.lock().expect("counter lock poisoned");
        counters.misses += 1;
    }
}

/// Recursively mirror `src` at `dst`: directories are created, files are
/// hardlinked (copied when linking fails), symlinks are recreated. Existing
/// destination files are replaced, so repeated rehydration is idempotent.
/// Returns the number of file bytes now reachable at `dst`.
pub fn hardlink_copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    let mut bytes = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| PactownError::io(src, std::io::Error::other(e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walk stays under src");
        let target = if rel.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(rel)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| PactownError::io(&target, e))?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())
                .map_err(|e| PactownError::io(entry.path(), e))?;
            let _ = std::fs::remove_file(&target);
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)
                .map_err(|e| PactownError::io(&target, e))?;
            #[cfg(not(unix))]
            {
                let _ = link;
            }
        } else {
            if target.exists() {
                std::fs::remove_file(&target).map_err(|e| PactownError::io(&target, e))?;
            }
            if std::fs::hard_link(entry.path(), &target).is_err() {
                std::fs::copy(entry.path(), &target)
                    .map_err(|e| PactownError::io(&target, e))?;
            }
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(bytes)
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) {
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache(dir: &Path) -> DependencyCache {
        DependencyCache::new(CacheConfig {
            enabled: true,
            root: Some(dir.to_path_buf()),
            max_entries: 64,
            max_total_bytes: u64::MAX,
        })
    }

    fn fake_node_sandbox(dir: &Path, modules: &[&str]) {
        for module in modules {
            let module_dir = dir.join("node_modules").join(module);
            std::fs::create_dir_all(&module_dir).unwrap();
            std::fs::write(module_dir.join("index.js"), format!("// {module}\n")).unwrap();
        }
    }

    #[test]
    fn fingerprint_ignores_line_order_and_whitespace() {
        let a = fingerprint(
            RuntimeKind::Python,
            &["fastapi".into(), "uvicorn".into()],
        );
        let b = fingerprint(
            RuntimeKind::Python,
            &["  uvicorn ".into(), "FastAPI".into()],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_depends_on_runtime_and_content() {
        let py = fingerprint(RuntimeKind::Python, &["express".into()]);
        let node = fingerprint(RuntimeKind::Node, &["express".into()]);
        let other = fingerprint(RuntimeKind::Node, &["koa".into()]);
        assert_ne!(py, node);
        assert_ne!(node, other);
    }

    #[test]
    fn empty_set_has_a_distinct_sentinel() {
        let empty = fingerprint(RuntimeKind::Python, &[]);
        let comments_only = fingerprint(RuntimeKind::Python, &["# nothing".into(), "  ".into()]);
        let real = fingerprint(RuntimeKind::Python, &["fastapi".into()]);
        assert_eq!(empty, comments_only);
        assert_ne!(empty, real);
        assert_eq!(empty.len(), 64);
    }

    #[test]
    fn store_then_get_is_a_hit() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();
        fake_node_sandbox(sandbox.path(), &["express"]);

        let cache = test_cache(root.path());
        let fp = fingerprint(RuntimeKind::Node, &["express".into()]);
        cache.store(RuntimeKind::Node, &fp, sandbox.path()).unwrap();

        let hit = cache.get_cached(RuntimeKind::Node, &fp).expect("hit");
        assert_eq!(hit.fingerprint, fp);
        assert!(hit.root_path.join("node_modules/express/index.js").exists());
        assert!(hit.size_bytes > 0);
    }

    #[test]
    fn missing_marker_quarantines_and_misses() {
        let root = tempfile::tempdir().unwrap();
        let cache = test_cache(root.path());
        let fp = fingerprint(RuntimeKind::Node, &["express".into()]);

        // Entry directory present but without a node_modules tree.
        let dir = root.path().join("node").join(&fp);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(META_FILE), "{}").unwrap();

        assert!(cache.get_cached(RuntimeKind::Node, &fp).is_none());
        assert!(!dir.exists(), "corrupt entry must be moved aside");
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn rehydrated_tree_matches_the_snapshot() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();
        fake_node_sandbox(sandbox.path(), &["express", "pg"]);

        let cache = test_cache(root.path());
        let fp = fingerprint(RuntimeKind::Node, &["express".into(), "pg".into()]);
        cache.store(RuntimeKind::Node, &fp, sandbox.path()).unwrap();

        let target = tempfile::tempdir().unwrap();
        // Leftover from a prior run gets overwritten.
        std::fs::create_dir_all(target.path().join("node_modules/express")).unwrap();
        std::fs::write(
            target.path().join("node_modules/express/index.js"),
            "stale\n",
        )
        .unwrap();

        let hit = cache.get_cached(RuntimeKind::Node, &fp).unwrap();
        cache.rehydrate(&hit, target.path()).unwrap();

        let rehydrated =
            std::fs::read_to_string(target.path().join("node_modules/express/index.js")).unwrap();
        assert_eq!(rehydrated, "// express\n");
        assert!(target.path().join("node_modules/pg/index.js").exists());
        assert!(!target.path().join(META_FILE).exists());
    }

    #[test]
    fn staging_directories_are_never_reported_as_entries() {
        let root = tempfile::tempdir().unwrap();
        let cache = test_cache(root.path());
        let staging = root.path().join("node").join(".staging-abc-1");
        std::fs::create_dir_all(&staging).unwrap();
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn eviction_drops_least_recent_first_and_skips_referenced() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();
        fake_node_sandbox(sandbox.path(), &["express"]);

        let cache = DependencyCache::new(CacheConfig {
            enabled: true,
            root: Some(root.path().to_path_buf()),
            max_entries: 1,
            max_total_bytes: u64::MAX,
        });

        let old_fp = fingerprint(RuntimeKind::Node, &["old".into()]);
        let new_fp = fingerprint(RuntimeKind::Node, &["new".into()]);
        cache.store(RuntimeKind::Node, &old_fp, sandbox.path()).unwrap();
        cache.retain(RuntimeKind::Node, &old_fp).unwrap();
        cache.store(RuntimeKind::Node, &new_fp, sandbox.path()).unwrap();

        // Both survive: the older one is pinned, and eviction already ran
        // inside the second store.
        assert!(cache.get_cached(RuntimeKind::Node, &old_fp).is_some());

        cache.release(RuntimeKind::Node, &old_fp).unwrap();
        cache.evict_if_needed();
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn purge_respects_ref_counts() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();
        fake_node_sandbox(sandbox.path(), &["express"]);

        let cache = test_cache(root.path());
        let pinned = fingerprint(RuntimeKind::Node, &["a".into()]);
        let loose = fingerprint(RuntimeKind::Node, &["b".into()]);
        cache.store(RuntimeKind::Node, &pinned, sandbox.path()).unwrap();
        cache.store(RuntimeKind::Node, &loose, sandbox.path()).unwrap();
        cache.retain(RuntimeKind::Node, &pinned).unwrap();

        assert_eq!(cache.purge().unwrap(), 1);
        assert!(cache.get_cached(RuntimeKind::Node, &pinned).is_some());
    }

    #[test]
    fn same_fingerprint_shares_one_lock() {
        let root = tempfile::tempdir().unwrap();
        let cache = test_cache(root.path());
        let a = cache.lock_for("abc");
        let b = cache.lock_for("abc");
        let c = cache.lock_for("def");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn disabled_cache_never_hits() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();
        fake_node_sandbox(sandbox.path(), &["express"]);

        let cache = DependencyCache::new(CacheConfig {
            enabled: false,
            root: Some(root.path().to_path_buf()),
            ..CacheConfig::default()
        });
        let fp = fingerprint(RuntimeKind::Node, &["express".into()]);
        cache.store(RuntimeKind::Node, &fp, sandbox.path()).unwrap();
        assert!(cache.get_cached(RuntimeKind::Node, &fp).is_none());
    }
}
