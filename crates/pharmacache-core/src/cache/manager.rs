use std::path::{Path, PathBuf};

use chrono::Duration;
use tracing::{debug, error, info};

use super::expiring::{CachedData, ExpiringCache};
use crate::config::Config;
use crate::models::{LocationKey, MapViewState, PharmacyRecord, UserLocation};

/// Fixed key for the single user-location slot
const USER_LOCATION_KEY: &str = "user_location";

/// Fixed key for the single map-state slot
const MAP_STATE_KEY: &str = "map_state";

/// Expiry durations per category. Fixed once the manager is built.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub results: Duration,
    pub map_state: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            results: Duration::hours(24),
            map_state: Duration::days(7),
        }
    }
}

impl From<&Config> for CachePolicy {
    fn from(config: &Config) -> Self {
        Self {
            results: config.cache_expiry(),
            map_state: config.map_state_expiry(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCategory {
    Pharmacies,
    UserLocation,
    MapState,
}

impl CacheCategory {
    pub fn name(&self) -> &'static str {
        match self {
            CacheCategory::Pharmacies => "pharmacies",
            CacheCategory::UserLocation => "location",
            CacheCategory::MapState => "map_state",
        }
    }
}

/// Persistent, expiring storage for pharmacy results, the user's location
/// and the last map view.
pub struct CacheManager {
    cache_dir: PathBuf,
    pharmacies: ExpiringCache<Vec<PharmacyRecord>>,
    location: ExpiringCache<UserLocation>,
    map_state: ExpiringCache<MapViewState>,
}

impl CacheManager {
    /// Open (or create) the cache under `cache_dir`, loading any snapshots.
    ///
    /// A directory that can't be created is logged; the manager still works
    /// from memory.
    pub fn new(cache_dir: PathBuf, policy: CachePolicy) -> Self {
        if let Err(e) = std::fs::create_dir_all(&cache_dir) {
            error!(dir = %cache_dir.display(), error = %e, "Failed to create cache directory");
        }

        let manager = Self {
            pharmacies: ExpiringCache::open(
                CacheCategory::Pharmacies.name(),
                &cache_dir,
                policy.results,
            ),
            location: ExpiringCache::open(
                CacheCategory::UserLocation.name(),
                &cache_dir,
                policy.results,
            ),
            map_state: ExpiringCache::open(
                CacheCategory::MapState.name(),
                &cache_dir,
                policy.map_state,
            ),
            cache_dir,
        };
        info!(stats = %manager.stats(), "Cache loaded");
        manager
    }

    /// A manager that never touches the disk.
    pub fn in_memory(policy: CachePolicy) -> Self {
        Self {
            cache_dir: PathBuf::new(),
            pharmacies: ExpiringCache::in_memory(CacheCategory::Pharmacies.name(), policy.results),
            location: ExpiringCache::in_memory(CacheCategory::UserLocation.name(), policy.results),
            map_state: ExpiringCache::in_memory(CacheCategory::MapState.name(), policy.map_state),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    // ===== Pharmacies =====

    pub fn put_pharmacies(&self, lat: f64, lon: f64, records: &[PharmacyRecord]) {
        self.put_pharmacies_for_key(&LocationKey::from_coords(lat, lon), records);
    }

    pub fn put_pharmacies_for_key(&self, key: &LocationKey, records: &[PharmacyRecord]) {
        self.pharmacies.put(key.as_str(), records.to_vec());
        debug!(key = %key, count = records.len(), "Cached pharmacies");
    }

    /// Cached results for the cell containing `(lat, lon)`, with distances
    /// recomputed from that exact point.
    pub fn get_pharmacies(&self, lat: f64, lon: f64) -> Option<Vec<PharmacyRecord>> {
        let mut records = self.get_pharmacies_for_key(&LocationKey::from_coords(lat, lon))?;
        for record in records.iter_mut() {
            record.compute_distance_from(lat, lon);
        }
        Some(records)
    }

    pub fn get_pharmacies_for_key(&self, key: &LocationKey) -> Option<Vec<PharmacyRecord>> {
        self.pharmacies.get(key.as_str())
    }

    // ===== User Location =====

    pub fn put_user_location(&self, location: &UserLocation) {
        self.location.put(USER_LOCATION_KEY, location.clone());
    }

    pub fn get_user_location(&self) -> Option<UserLocation> {
        self.location.get(USER_LOCATION_KEY)
    }

    // ===== Map State =====

    pub fn put_map_state(&self, state: &MapViewState) {
        self.map_state.put(MAP_STATE_KEY, state.clone());
    }

    pub fn get_map_state(&self) -> Option<MapViewState> {
        self.map_state.get(MAP_STATE_KEY)
    }

    // ===== Maintenance =====

    pub fn clear_expired(&self) -> usize {
        let removed =
            self.pharmacies.clear_expired() + self.location.clear_expired() + self.map_state.clear_expired();
        info!(removed, "Expired cache entries cleared");
        removed
    }

    pub fn clear_all(&self) {
        self.pharmacies.clear_all();
        self.location.clear_all();
        self.map_state.clear_all();
        info!("All caches cleared");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            pharmacy_entries: self.pharmacies.len(),
            location_entries: self.location.len(),
            has_map_state: !self.map_state.is_empty(),
            last_updated: self
                .pharmacies
                .newest()
                .map(|at| CachedData::with_timestamp((), at).age_display()),
        }
    }

    #[cfg(test)]
    pub(crate) fn pharmacies_raw(&self) -> &ExpiringCache<Vec<PharmacyRecord>> {
        &self.pharmacies
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheStats {
    pub pharmacy_entries: usize,
    pub location_entries: usize,
    pub has_map_state: bool,
    pub last_updated: Option<String>,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pharmacies={}, locations={}, map_state={}, updated={}",
            self.pharmacy_entries,
            self.location_entries,
            self.has_map_state,
            self.last_updated.as_deref().unwrap_or("never")
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pharmacy(id: &str, lat: f64, lon: f64) -> PharmacyRecord {
        PharmacyRecord::new(id, Some(format!("Pharmacie {}", id)), lat, lon)
    }

    #[test]
    fn test_cache_reuse_recomputes_distance() {
        let cache = CacheManager::in_memory(CachePolicy::default());
        let key = LocationKey::from_raw("33.573,-7.590");
        let records = vec![
            pharmacy("p1", 33.5740, -7.5880),
            pharmacy("p2", 33.5800, -7.6000),
            pharmacy("p3", 33.5600, -7.5700),
        ];
        cache.put_pharmacies_for_key(&key, &records);

        let got = cache.get_pharmacies(33.5733, -7.5897).unwrap();
        let ids: Vec<_> = got.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
        for p in &got {
            let expected = crate::models::distance_km(33.5733, -7.5897, p.latitude, p.longitude);
            assert!((p.distance_km - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_get_returns_a_copy() {
        let cache = CacheManager::in_memory(CachePolicy::default());
        cache.put_pharmacies(10.0, 10.0, &[pharmacy("a", 10.0, 10.0)]);
        let mut first = cache.get_pharmacies(10.0, 10.0).unwrap();
        first[0].name = "changed".into();
        let second = cache.get_pharmacies(10.0, 10.0).unwrap();
        assert_eq!(second[0].name, "Pharmacie a");
    }

    #[test]
    fn test_expired_pharmacies_are_absent() {
        let cache = CacheManager::in_memory(CachePolicy::default());
        let key = LocationKey::from_coords(1.0, 1.0);
        cache.pharmacies_raw().put_entry(
            key.as_str(),
            CachedData::with_timestamp(vec![pharmacy("a", 1.0, 1.0)], Utc::now() - Duration::hours(25)),
        );
        assert!(cache.get_pharmacies_for_key(&key).is_none());
    }

    #[test]
    fn test_singleton_slots() {
        let cache = CacheManager::in_memory(CachePolicy::default());
        assert!(cache.get_user_location().is_none());
        assert!(cache.get_map_state().is_none());

        let loc = UserLocation::new(33.5, -7.6).unwrap();
        cache.put_user_location(&loc);
        cache.put_map_state(&MapViewState::new(33.5, -7.6, 13, Some("Maarif".into())));
        cache.put_map_state(&MapViewState::new(34.0, -6.8, 12, None));

        assert_eq!(cache.get_user_location(), Some(loc));
        let state = cache.get_map_state().unwrap();
        assert_eq!(state.zoom, 12);

        let stats = cache.stats();
        assert_eq!(stats.location_entries, 1);
        assert!(stats.has_map_state);
    }

    #[test]
    fn test_persists_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = CacheManager::new(dir.path().to_path_buf(), CachePolicy::default());
            cache.put_pharmacies(33.5731, -7.5898, &[pharmacy("a", 33.574, -7.589)]);
            cache.put_user_location(&UserLocation::new(33.5731, -7.5898).unwrap());
        }
        assert!(dir.path().join("pharmacies.json").exists());
        assert!(dir.path().join("location.json").exists());

        let cache = CacheManager::new(dir.path().to_path_buf(), CachePolicy::default());
        assert_eq!(cache.get_pharmacies(33.5731, -7.5898).unwrap().len(), 1);
        assert!(cache.get_user_location().is_some());
        assert!(cache.get_map_state().is_none());
    }

    #[test]
    fn test_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::new(dir.path().to_path_buf(), CachePolicy::default());
        cache.put_pharmacies(1.0, 1.0, &[pharmacy("a", 1.0, 1.0)]);
        cache.clear_all();
        assert_eq!(cache.stats(), CacheStats::default());
        assert!(!dir.path().join("pharmacies.json").exists());
    }

    #[test]
    fn test_stats_display() {
        let stats = CacheStats::default();
        assert_eq!(
            stats.to_string(),
            "pharmacies=0, locations=0, map_state=false, updated=never"
        );
    }
}
