use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// A cached value and the moment it was written.
///
/// Entries are never mutated; a put always stores a fresh `CachedData`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn with_timestamp(data: T, cached_at: DateTime<Utc>) -> Self {
        Self { data, cached_at }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew (negative ages)
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }

    /// Expired once strictly more than `ttl` has elapsed since the write.
    pub fn is_expired_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.cached_at > ttl
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.is_expired_at(ttl, Utc::now())
    }
}

/// One cache category: a concurrent map with a fixed expiry policy and an
/// optional JSON snapshot on disk.
///
/// Every `put` rewrites the whole snapshot. Disk errors are logged and the
/// in-memory map stays authoritative.
pub struct ExpiringCache<T> {
    name: &'static str,
    ttl: Duration,
    snapshot: Option<PathBuf>,
    entries: DashMap<String, CachedData<T>>,
    /// Serializes snapshot writes so two puts can't interleave file contents.
    persist_lock: Mutex<()>,
}

impl<T> ExpiringCache<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    /// Open a category backed by `<dir>/<name>.json`, purging expired entries.
    pub fn open(name: &'static str, dir: &Path, ttl: Duration) -> Self {
        let path = dir.join(format!("{}.json", name));
        let cache = Self {
            name,
            ttl,
            snapshot: Some(path),
            entries: DashMap::new(),
            persist_lock: Mutex::new(()),
        };
        cache.load_snapshot();
        cache
    }

    /// A category that never touches the disk.
    pub fn in_memory(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            snapshot: None,
            entries: DashMap::new(),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn put(&self, key: &str, value: T) {
        self.put_entry(key, CachedData::new(value));
    }

    pub(crate) fn put_entry(&self, key: &str, entry: CachedData<T>) {
        self.entries.insert(key.to_string(), entry);
        self.persist();
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.get_at(key, Utc::now())
    }

    /// Lookup with lazy expiry: an expired entry is evicted and reported absent.
    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired_at(self.ttl, now) {
                debug!(cache = self.name, key, "Cache hit");
                return Some(entry.data.clone());
            }
        }
        // Ref dropped above; removing while holding it would deadlock the shard
        self.evict_expired(key, now)
    }

    /// Remove `key` if it is still expired at `now`. An entry replaced by a
    /// concurrent `put` since the caller's read is returned instead.
    fn evict_expired(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        let ttl = self.ttl;
        if self
            .entries
            .remove_if(key, |_, entry| entry.is_expired_at(ttl, now))
            .is_some()
        {
            info!(cache = self.name, key, "Cache entry expired");
            return None;
        }
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(ttl, now))
            .map(|entry| entry.data.clone())
    }

    /// Timestamped entry without expiry filtering, for age reporting.
    pub fn peek(&self, key: &str) -> Option<CachedData<T>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Most recent write time across all entries.
    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|e| e.cached_at).max()
    }

    pub fn clear_expired(&self) -> usize {
        self.clear_expired_at(Utc::now())
    }

    pub fn clear_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| !entry.is_expired_at(ttl, now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(cache = self.name, removed, "Cleared expired entries");
            self.persist();
        }
        removed
    }

    pub fn clear_all(&self) {
        self.entries.clear();
        if let Some(ref path) = self.snapshot {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(cache = self.name, "Snapshot deleted"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => error!(cache = self.name, error = %e, "Failed to delete snapshot"),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn load_snapshot(&self) {
        let Some(ref path) = self.snapshot else {
            return;
        };

        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(cache = self.name, "No snapshot on disk");
                return;
            }
            Err(e) => {
                warn!(cache = self.name, error = %e, "Failed to read snapshot, starting empty");
                return;
            }
        };

        // A corrupt snapshot drops the whole category rather than half of it
        let loaded: BTreeMap<String, CachedData<T>> = match serde_json::from_str(&contents) {
            Ok(map) => map,
            Err(e) => {
                warn!(cache = self.name, error = %e, "Failed to parse snapshot, dropping category");
                return;
            }
        };

        let now = Utc::now();
        let total = loaded.len();
        for (key, entry) in loaded {
            if !entry.is_expired_at(self.ttl, now) {
                self.entries.insert(key, entry);
            }
        }
        info!(
            cache = self.name,
            loaded = self.entries.len(),
            purged = total - self.entries.len(),
            "Loaded snapshot from disk"
        );
    }

    fn persist(&self) {
        let Some(ref path) = self.snapshot else {
            return;
        };

        let _guard = self.persist_lock.lock();
        let snapshot: BTreeMap<String, CachedData<T>> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let contents = match serde_json::to_string_pretty(&snapshot) {
            Ok(c) => c,
            Err(e) => {
                error!(cache = self.name, error = %e, "Failed to serialize snapshot");
                return;
            }
        };

        if let Err(e) = write_atomic(path, contents.as_bytes()) {
            error!(cache = self.name, error = %e, "Failed to save snapshot, keeping in memory only");
        } else {
            debug!(cache = self.name, entries = snapshot.len(), "Snapshot saved");
        }
    }
}

/// Write through a temporary sibling and rename, so readers never see a
/// half-written file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_data_age_display_just_now() {
        let cached = CachedData::new(vec![1, 2, 3]);
        assert_eq!(cached.age_display(), "just now");
    }

    #[test]
    fn test_cached_data_age_display_hours() {
        let cached = CachedData::with_timestamp(1, Utc::now() - Duration::minutes(150));
        assert_eq!(cached.age_display(), "2h ago");
    }

    #[test]
    fn test_expiry_boundary() {
        let cache = ExpiringCache::in_memory("test", Duration::hours(24));
        let t0 = Utc::now();
        cache.put_entry("k", CachedData::with_timestamp("v".to_string(), t0));

        let almost = t0 + Duration::hours(23) + Duration::minutes(59);
        assert_eq!(cache.get_at("k", almost), Some("v".to_string()));

        let past = t0 + Duration::hours(24) + Duration::minutes(1);
        assert_eq!(cache.get_at("k", past), None);
        // Evicted on the expired read
        assert!(cache.is_empty());
    }

    #[test]
    fn test_eviction_spares_entry_replaced_after_read() {
        let cache = ExpiringCache::in_memory("test", Duration::hours(1));
        let t0 = Utc::now();
        let later = t0 + Duration::hours(2);
        cache.put_entry("k", CachedData::with_timestamp("old".to_string(), t0));
        // A writer lands between the expired read and the eviction
        cache.put_entry("k", CachedData::with_timestamp("new".to_string(), later));

        assert_eq!(cache.evict_expired("k", later), Some("new".to_string()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_at("k", later), Some("new".to_string()));

        assert_eq!(cache.evict_expired("k", later + Duration::hours(2)), None);
        assert!(cache.is_empty());
        assert_eq!(cache.evict_expired("missing", later), None);
    }

    #[test]
    fn test_put_replaces() {
        let cache = ExpiringCache::in_memory("test", Duration::hours(1));
        cache.put("k", 1);
        cache.put("k", 2);
        assert_eq!(cache.get("k"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_expired_keeps_fresh() {
        let cache = ExpiringCache::in_memory("test", Duration::hours(1));
        cache.put_entry("old", CachedData::with_timestamp(1, Utc::now() - Duration::hours(2)));
        cache.put("new", 2);
        assert_eq!(cache.clear_expired(), 1);
        assert_eq!(cache.get("new"), Some(2));
        assert!(cache.peek("old").is_none());
    }

    #[test]
    fn test_snapshot_survives_reopen_and_purges_expired() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = ExpiringCache::open("numbers", dir.path(), Duration::hours(1));
            cache.put("fresh", 1u32);
            cache.put_entry("stale", CachedData::with_timestamp(2u32, Utc::now() - Duration::hours(3)));
        }
        let reopened: ExpiringCache<u32> = ExpiringCache::open("numbers", dir.path(), Duration::hours(1));
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("fresh"), Some(1));
        assert!(!dir.path().join("numbers.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_snapshot_drops_category() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("numbers.json"), "{ not json").unwrap();
        let cache: ExpiringCache<u32> = ExpiringCache::open("numbers", dir.path(), Duration::hours(1));
        assert!(cache.is_empty());
        // Still usable, and the next put repairs the file
        cache.put("a", 7);
        let reopened: ExpiringCache<u32> = ExpiringCache::open("numbers", dir.path(), Duration::hours(1));
        assert_eq!(reopened.get("a"), Some(7));
    }

    #[test]
    fn test_unwritable_snapshot_keeps_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the snapshot file should be makes every write fail
        std::fs::create_dir(dir.path().join("numbers.json")).unwrap();
        let cache = ExpiringCache::open("numbers", dir.path(), Duration::hours(1));
        cache.put("a", 1u32);
        assert_eq!(cache.get("a"), Some(1));
    }

    #[test]
    fn test_clear_all_removes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ExpiringCache::open("numbers", dir.path(), Duration::hours(1));
        cache.put("a", 1u32);
        assert!(dir.path().join("numbers.json").exists());
        cache.clear_all();
        assert!(cache.is_empty());
        assert!(!dir.path().join("numbers.json").exists());
    }
}
