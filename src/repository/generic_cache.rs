use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use super::{write_bytes_atomic, RepositoryError};
use crate::utils::hash::hash_generic_key;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskEntry {
    value: Value,
    expires_at: f64,
}

#[derive(Debug, Default)]
struct CacheInner {
    // hashed key -> (value, absolute expiry as unix seconds)
    entries: HashMap<String, (Value, f64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenericCacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub default_ttl_secs: u64,
    pub max_entries: usize,
    pub cleanup_running: bool,
}

/// In-memory cache with per-entry TTL, a size cap, and JSON persistence.
///
/// Values are plain JSON data so the disk round trip is lossless; typed
/// wrappers live above this layer.
pub struct GenericCache {
    inner: Mutex<CacheInner>,
    default_ttl: Duration,
    max_entries: usize,
    cache_file: PathBuf,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl GenericCache {
    pub fn new(cache_file: PathBuf, default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            default_ttl,
            max_entries,
            cache_file,
            cleanup_task: Mutex::new(None),
        }
    }

    /// Looks a value up by its key payload; entries past their deadline are
    /// removed on the way out.
    pub fn get(&self, key_data: &Value) -> Option<Value> {
        let key = hash_generic_key(key_data);
        self.get_hashed(&key)
    }

    pub fn get_hashed(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().expect("generic cache lock poisoned");
        let now = unix_now();

        match inner.entries.get(key) {
            Some((_, expires_at)) if *expires_at <= now => {
                inner.entries.remove(key);
                log::debug!("Generic cache expired: {}", &key[..16.min(key.len())]);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    pub fn set(&self, key_data: &Value, value: Value, ttl: Option<Duration>) {
        let key = hash_generic_key(key_data);
        self.set_hashed(key, value, ttl);
    }

    pub fn set_hashed(&self, key: String, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = unix_now() + ttl.as_secs_f64();

        let mut inner = self.inner.lock().expect("generic cache lock poisoned");
        inner.entries.insert(key, (value, expires_at));

        // Amortised cap enforcement keeps the map bounded even when no
        // cleanup task is running.
        if inner.entries.len() > self.max_entries {
            Self::evict_oldest(&mut inner, self.max_entries);
        }
    }

    pub fn invalidate(&self, key_data: &Value) -> bool {
        let key = hash_generic_key(key_data);
        self.invalidate_hashed(&key)
    }

    pub fn invalidate_hashed(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("generic cache lock poisoned");
        inner.entries.remove(key).is_some()
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock().expect("generic cache lock poisoned");
        let count = inner.entries.len();
        inner.entries.clear();
        log::info!("Cleared all generic cache entries ({count} items)");
    }

    /// Removes entries whose deadline has passed; returns how many went.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock().expect("generic cache lock poisoned");
        let now = unix_now();
        let before = inner.entries.len();
        inner.entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - inner.entries.len()
    }

    /// Drops oldest-expiring entries until the cache fits the cap.
    pub fn enforce_size_limits(&self) -> usize {
        let mut inner = self.inner.lock().expect("generic cache lock poisoned");
        Self::evict_oldest(&mut inner, self.max_entries)
    }

    fn evict_oldest(inner: &mut CacheInner, max_entries: usize) -> usize {
        if inner.entries.len() <= max_entries {
            return 0;
        }

        let mut by_expiry: Vec<(String, f64)> = inner
            .entries
            .iter()
            .map(|(k, (_, expires_at))| (k.clone(), *expires_at))
            .collect();
        by_expiry.sort_by(|a, b| a.1.total_cmp(&b.1));

        let excess = inner.entries.len() - max_entries;
        for (key, _) in by_expiry.into_iter().take(excess) {
            inner.entries.remove(&key);
        }

        log::info!("Enforced size limit: removed {excess} oldest entries");
        excess
    }

    pub fn get_stats(&self) -> GenericCacheStats {
        let inner = self.inner.lock().expect("generic cache lock poisoned");
        let now = unix_now();
        let valid = inner.entries.values().filter(|(_, expires_at)| *expires_at > now).count();

        GenericCacheStats {
            total_entries: inner.entries.len(),
            valid_entries: valid,
            expired_entries: inner.entries.len() - valid,
            default_ttl_secs: self.default_ttl.as_secs(),
            max_entries: self.max_entries,
            cleanup_running: self
                .cleanup_task
                .lock()
                .expect("cleanup task lock poisoned")
                .as_ref()
                .is_some_and(|t| !t.is_finished()),
        }
    }

    /// Spawns the periodic cleanup loop. Idempotent; a second call while the
    /// loop is alive is a no-op.
    pub fn start_cleanup_task(self: &std::sync::Arc<Self>, interval: Duration) {
        let mut slot = self.cleanup_task.lock().expect("cleanup task lock poisoned");
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            log::debug!("Cleanup task already running; skipping restart");
            return;
        }

        let cache = std::sync::Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the loop waits a
            // full interval before its first sweep.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cleaned = cache.cleanup_expired();
                if cleaned > 0 {
                    log::debug!("Periodic cleanup removed {cleaned} expired entries");
                }
                let evicted = cache.enforce_size_limits();
                if evicted > 0 {
                    log::debug!("Periodic size enforcement removed {evicted} oldest entries");
                }
            }
        }));
    }

    pub fn stop_cleanup_task(&self) {
        let mut slot = self.cleanup_task.lock().expect("cleanup task lock poisoned");
        if let Some(task) = slot.take() {
            task.abort();
            log::debug!("Stopped cleanup task");
        }
    }

    pub async fn save_to_disk(&self) -> Result<(), RepositoryError> {
        let payload: HashMap<String, DiskEntry> = {
            let inner = self.inner.lock().expect("generic cache lock poisoned");
            inner
                .entries
                .iter()
                .map(|(key, (value, expires_at))| {
                    (key.clone(), DiskEntry { value: value.clone(), expires_at: *expires_at })
                })
                .collect()
        };

        if payload.is_empty() {
            if self.cache_file.exists() {
                tokio::fs::remove_file(&self.cache_file).await?;
                log::info!("Deleted empty generic cache file: {}", self.cache_file.display());
            }
            return Ok(());
        }

        let bytes = serde_json::to_vec_pretty(&payload)?;
        let target = self.cache_file.clone();
        let written = payload.len();
        tokio::task::spawn_blocking(move || write_bytes_atomic(&target, &bytes))
            .await
            .map_err(|join_err| std::io::Error::other(join_err.to_string()))??;

        log::info!("Generic cache saved to {} ({} entries)", self.cache_file.display(), written);
        Ok(())
    }

    /// Restores non-expired entries from disk; a corrupt or missing file
    /// simply means starting fresh.
    pub async fn load_from_disk(&self) -> Result<usize, RepositoryError> {
        if !self.cache_file.exists() {
            log::debug!("Generic cache file {} not found; starting fresh", self.cache_file.display());
            return Ok(0);
        }

        let raw = tokio::fs::read(&self.cache_file).await?;
        let payload: HashMap<String, DiskEntry> = match serde_json::from_slice(&raw) {
            Ok(payload) => payload,
            Err(parse_err) => {
                log::warn!("Failed to load generic cache file {}: {parse_err}", self.cache_file.display());
                return Ok(0);
            }
        };

        let now = unix_now();
        let mut restored = 0;
        {
            let mut inner = self.inner.lock().expect("generic cache lock poisoned");
            for (key, entry) in payload {
                if entry.expires_at <= now {
                    continue;
                }
                inner.entries.insert(key, (entry.value, entry.expires_at));
                restored += 1;
            }
            Self::evict_oldest(&mut inner, self.max_entries);
        }

        if restored > 0 {
            log::info!("Loaded {restored} generic cache entries from {}", self.cache_file.display());
        }
        Ok(restored)
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache_in(dir: &std::path::Path) -> GenericCache {
        GenericCache::new(dir.join("generic_cache.json"), Duration::from_secs(3600), 10_000)
    }

    #[test]
    fn test_set_get_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(dir.path());

        cache.set(&json!("key-1"), json!({"answer": 42}), None);
        assert_eq!(cache.get(&json!("key-1")), Some(json!({"answer": 42})));
        assert_eq!(cache.get(&json!("key-2")), None);
    }

    #[test]
    fn test_lazy_expiry_on_get() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(dir.path());

        cache.set(&json!("short"), json!(1), Some(Duration::from_secs(0)));
        assert_eq!(cache.get(&json!("short")), None);
        assert_eq!(cache.get_stats().total_entries, 0);
    }

    #[test]
    fn test_invalidate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(dir.path());

        cache.set(&json!("k"), json!("v"), None);
        assert!(cache.invalidate(&json!("k")));
        assert!(!cache.invalidate(&json!("k")));
        assert_eq!(cache.get(&json!("k")), None);
    }

    #[test]
    fn test_cleanup_expired_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(dir.path());

        cache.set(&json!("a"), json!(1), Some(Duration::from_secs(0)));
        cache.set(&json!("b"), json!(2), Some(Duration::from_secs(0)));
        cache.set(&json!("c"), json!(3), None);

        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.get_stats().total_entries, 1);
    }

    #[test]
    fn test_size_cap_drops_oldest_expiry_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = GenericCache::new(dir.path().join("g.json"), Duration::from_secs(3600), 2);

        cache.set(&json!("old"), json!(1), Some(Duration::from_secs(10)));
        cache.set(&json!("mid"), json!(2), Some(Duration::from_secs(100)));
        cache.set(&json!("new"), json!(3), Some(Duration::from_secs(1000)));

        assert_eq!(cache.get(&json!("old")), None);
        assert_eq!(cache.get(&json!("mid")), Some(json!(2)));
        assert_eq!(cache.get(&json!("new")), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_disk_roundtrip_drops_expired() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(dir.path());

        cache.set(&json!("keep"), json!({"v": 1}), Some(Duration::from_secs(3600)));
        cache.set(&json!("drop"), json!({"v": 2}), Some(Duration::from_secs(0)));
        cache.save_to_disk().await.expect("save");

        let restored = cache_in(dir.path());
        let count = restored.load_from_disk().await.expect("load");
        assert_eq!(count, 1);
        assert_eq!(restored.get(&json!("keep")), Some(json!({"v": 1})));
        assert_eq!(restored.get(&json!("drop")), None);
    }

    #[tokio::test]
    async fn test_empty_cache_save_removes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache_in(dir.path());

        cache.set(&json!("k"), json!(1), None);
        cache.save_to_disk().await.expect("save");
        assert!(dir.path().join("generic_cache.json").exists());

        cache.invalidate_all();
        cache.save_to_disk().await.expect("save empty");
        assert!(!dir.path().join("generic_cache.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_fresh() -> Result<(), crate::repository::test_helpers::TestSetupError> {
        crate::repository::test_helpers::init_logger()?;

        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("generic_cache.json"), b"not json").expect("write garbage");

        let cache = cache_in(dir.path());
        assert_eq!(cache.load_from_disk().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_task_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = std::sync::Arc::new(cache_in(dir.path()));

        cache.start_cleanup_task(Duration::from_millis(10));
        assert!(cache.get_stats().cleanup_running);
        // Restart while alive is a no-op.
        cache.start_cleanup_task(Duration::from_millis(10));

        cache.set(&json!("x"), json!(1), Some(Duration::from_secs(0)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get_stats().total_entries, 0);

        cache.stop_cleanup_task();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!cache.get_stats().cleanup_running);
    }
}
