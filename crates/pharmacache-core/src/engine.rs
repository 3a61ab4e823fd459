//! Wires the cache, connectivity monitor, tile store, tile origin and
//! loader together and owns their shutdown order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{OverpassClient, PharmacyFetcher};
use crate::cache::{CacheManager, CachePolicy, CacheStats};
use crate::config::Config;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor, ListenerId, ReachabilityProbe, TcpProbe};
use crate::loader::{LoadUpdate, LoaderSettings, NearbyLoader, SessionId};
use crate::models::{MapViewState, UserLocation};
use crate::tiles::{HttpTileSource, PrefetchReport, PrefetchSettings, TileOrigin, TileSource, TileStore};

/// The network-facing collaborators, swappable for tests.
pub struct Collaborators {
    pub fetcher: Arc<dyn PharmacyFetcher>,
    pub tile_source: Arc<dyn TileSource>,
    pub probe: Arc<dyn ReachabilityProbe>,
}

impl Collaborators {
    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher = OverpassClient::from_config(config).context("Failed to build pharmacy client")?;
        let tile_source = HttpTileSource::new(config.tile_url_template.clone(), &config.user_agent)
            .context("Failed to build tile client")?;
        Ok(Self {
            fetcher: Arc::new(fetcher),
            tile_source: Arc::new(tile_source),
            probe: Arc::new(TcpProbe),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileStats {
    pub tiles: u64,
    pub bytes: u64,
}

pub struct Engine {
    config: Config,
    cache: Arc<CacheManager>,
    connectivity: Arc<ConnectivityMonitor>,
    tiles: Arc<TileStore>,
    origin: TileOrigin,
    loader: Arc<NearbyLoader>,
    last_query: Arc<Mutex<Option<(f64, f64)>>>,
    prefetch: Mutex<Option<JoinHandle<PrefetchReport>>>,
    listener: Mutex<Option<(ListenerId, JoinHandle<()>)>>,
}

impl Engine {
    /// Start everything against the real network.
    pub async fn start(config: Config) -> Result<(Self, mpsc::UnboundedReceiver<LoadUpdate>)> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::start_with(config, collaborators).await
    }

    pub async fn start_with(
        config: Config,
        collaborators: Collaborators,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LoadUpdate>)> {
        let cache_dir = config.cache_dir().context("Failed to resolve cache directory")?;
        let tile_dir = config.tile_dir().context("Failed to resolve tile directory")?;

        let cache = Arc::new(CacheManager::new(cache_dir, CachePolicy::from(&config)));
        cache.clear_expired();

        let connectivity = Arc::new(
            ConnectivityMonitor::new(
                collaborators.probe,
                config.probe_hosts.clone(),
                config.probe_interval(),
                config.probe_timeout(),
            )
            .await,
        );

        let tiles = Arc::new(TileStore::new(
            tile_dir,
            collaborators.tile_source,
            PrefetchSettings::from(&config),
        ));
        let origin = TileOrigin::from_config(Arc::clone(&tiles), &config);
        if let Err(e) = origin.start() {
            warn!(error = %e, "Continuing without offline tiles");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let loader = Arc::new(NearbyLoader::new(
            Arc::clone(&cache),
            Arc::clone(&connectivity),
            collaborators.fetcher,
            LoaderSettings::from(&config),
            tx,
        ));

        let last_query = Arc::new(Mutex::new(None));
        let listener = Self::spawn_connectivity_listener(&connectivity, &loader, &last_query);

        info!(
            online = connectivity.is_online(),
            cache = %cache.stats(),
            "Engine started"
        );

        let engine = Self {
            config,
            cache,
            connectivity,
            tiles,
            origin,
            loader,
            last_query,
            prefetch: Mutex::new(None),
            listener: Mutex::new(Some(listener)),
        };
        Ok((engine, rx))
    }

    /// Reload the last query whenever connectivity flips: fresh data when
    /// back online, cached data when offline.
    fn spawn_connectivity_listener(
        connectivity: &ConnectivityMonitor,
        loader: &Arc<NearbyLoader>,
        last_query: &Arc<Mutex<Option<(f64, f64)>>>,
    ) -> (ListenerId, JoinHandle<()>) {
        let (id, mut events) = connectivity.subscribe();
        let loader = Arc::clone(loader);
        let last_query = Arc::clone(last_query);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConnectivityEvent::Online => info!("Connection restored, switching to online tiles"),
                    ConnectivityEvent::Offline => info!("Connection lost, switching to cached tiles"),
                }
                let query = *last_query.lock();
                if let Some((lat, lon)) = query {
                    loader.load_nearby(lat, lon);
                }
            }
        });
        (id, task)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn tiles(&self) -> &Arc<TileStore> {
        &self.tiles
    }

    pub fn origin(&self) -> &TileOrigin {
        &self.origin
    }

    pub fn loader(&self) -> &Arc<NearbyLoader> {
        &self.loader
    }

    /// Where to start: the cached user location, else the configured default.
    pub fn initial_location(&self) -> UserLocation {
        self.cache.get_user_location().unwrap_or_else(|| UserLocation {
            latitude: self.config.default_latitude,
            longitude: self.config.default_longitude,
            city: None,
            country: None,
            address: None,
        })
    }

    /// Record a new user position: cache it, prefetch tiles around it and
    /// load nearby pharmacies.
    pub fn on_user_location(&self, location: &UserLocation) -> SessionId {
        info!(lat = location.latitude, lon = location.longitude, "User location updated");
        self.cache.put_user_location(location);

        if self.connectivity.is_online() {
            if let Some(job) = self
                .tiles
                .pre_cache_tiles_around_location(location.latitude, location.longitude)
            {
                *self.prefetch.lock() = Some(job);
            }
        }

        self.load_nearby(location.latitude, location.longitude)
    }

    pub fn load_nearby(&self, lat: f64, lon: f64) -> SessionId {
        *self.last_query.lock() = Some((lat, lon));
        self.loader.load_nearby(lat, lon)
    }

    /// Tile URL template for the map: upstream while online, the local
    /// origin while offline (when it is running).
    pub fn tile_url_template(&self) -> String {
        if self.connectivity.is_offline() && self.origin.is_running() {
            self.origin.tile_url_template()
        } else {
            self.config.tile_url_template.clone()
        }
    }

    pub fn save_map_state(&self, state: &MapViewState) {
        self.cache.put_map_state(state);
    }

    pub fn map_state(&self) -> Option<MapViewState> {
        self.cache.get_map_state()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn tile_stats(&self) -> TileStats {
        TileStats {
            tiles: self.tiles.cached_tile_count(),
            bytes: self.tiles.cache_size_bytes(),
        }
    }

    /// Wait for the current prefetch batch, if one was started.
    pub async fn wait_for_prefetch(&self) -> Option<PrefetchReport> {
        let job = self.prefetch.lock().take()?;
        match job.await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Prefetch task failed");
                None
            }
        }
    }

    /// Timers, then probing, then prefetch, then worker pools, then the
    /// tile origin.
    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        let grace = self.config.shutdown_grace();

        self.loader.cancel_timers();

        if let Some((id, task)) = self.listener.lock().take() {
            self.connectivity.remove_listener(id);
            task.abort();
        }
        self.connectivity.shutdown();

        self.tiles.cancel();
        self.tiles.shutdown();

        self.loader.drain(grace).await;
        let job = self.prefetch.lock().take();
        if let Some(job) = job {
            drain_prefetch(job, grace).await;
        }

        self.origin.stop();
        info!("Engine stopped");
    }
}

async fn drain_prefetch(mut job: JoinHandle<PrefetchReport>, grace: Duration) {
    match tokio::time::timeout(grace, &mut job).await {
        Ok(Ok(report)) => info!(downloaded = report.downloaded, "Prefetch stopped"),
        Ok(Err(e)) => warn!(error = %e, "Prefetch task failed"),
        Err(_) => {
            warn!("Prefetch did not stop in time, aborting");
            job.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::loader::{LoadStatus, ResultSource};
    use crate::models::PharmacyRecord;
    use crate::tiles::store::tests::{MockSource, PNG};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const CASA: (f64, f64) = (33.5731, -7.5898);

    struct Switch(AtomicBool);

    #[async_trait]
    impl ReachabilityProbe for Switch {
        async fn is_reachable(&self, _host: &str, _timeout: Duration) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct OnePharmacy;

    #[async_trait]
    impl PharmacyFetcher for OnePharmacy {
        async fn fetch(&self, lat: f64, lon: f64, _radius_m: u32) -> Result<Vec<PharmacyRecord>, ApiError> {
            Ok(vec![PharmacyRecord::new("p1", Some("Pharmacie Centrale".into()), lat + 0.001, lon)])
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            cache_dir: Some(dir.to_path_buf()),
            tile_min_zoom: 13,
            tile_max_zoom: 13,
            tile_download_delay_ms: 0,
            tile_origin_port: 0,
            probe_hosts: vec!["probe.test:53".into()],
            probe_interval_secs: 3600,
            shutdown_grace_ms: 500,
            ..Config::default()
        }
    }

    async fn start(dir: &std::path::Path, online: bool) -> (Engine, mpsc::UnboundedReceiver<LoadUpdate>, Arc<Switch>) {
        let probe = Arc::new(Switch(AtomicBool::new(online)));
        let collaborators = Collaborators {
            fetcher: Arc::new(OnePharmacy),
            tile_source: Arc::new(MockSource::new()),
            probe: probe.clone(),
        };
        let (engine, rx) = Engine::start_with(test_config(dir), collaborators).await.unwrap();
        (engine, rx, probe)
    }

    async fn next_terminal(rx: &mut mpsc::UnboundedReceiver<LoadUpdate>) -> LoadStatus {
        loop {
            let update = rx.recv().await.unwrap();
            if update.status.is_terminal() {
                return update.status;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_online_then_offline_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, probe) = start(dir.path(), true).await;
        assert_eq!(engine.tile_url_template(), Config::default().tile_url_template);

        let location = UserLocation::new(CASA.0, CASA.1).unwrap();
        engine.on_user_location(&location);
        assert!(matches!(
            next_terminal(&mut rx).await,
            LoadStatus::Success { source: ResultSource::Live, .. }
        ));
        let report = engine.wait_for_prefetch().await.unwrap();
        assert_eq!(report.downloaded, 169);

        // Drop offline: the listener reloads the last query from cache
        probe.0.store(false, Ordering::SeqCst);
        engine.connectivity().check_now().await;
        assert!(matches!(
            next_terminal(&mut rx).await,
            LoadStatus::Success { source: ResultSource::Cache, .. }
        ));

        let template = engine.tile_url_template();
        assert!(template.starts_with("http://127.0.0.1:"));
        let url = template
            .replace("{z}", "13")
            .replace("{x}", "3923")
            .replace("{y}", "3284");
        let body = reqwest::get(url).await.unwrap().bytes().await.unwrap();
        assert_eq!(body.as_ref(), PNG);

        assert_eq!(engine.tile_stats().tiles, 169);
        assert_eq!(engine.cache_stats().pharmacy_entries, 1);
        assert_eq!(engine.initial_location(), location);

        engine.shutdown().await;
        assert!(!engine.origin().is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_start_uses_defaults_and_skips_prefetch() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut rx, _probe) = start(dir.path(), false).await;

        let initial = engine.initial_location();
        assert_eq!((initial.latitude, initial.longitude), CASA);

        engine.on_user_location(&initial);
        assert_eq!(next_terminal(&mut rx).await, LoadStatus::OfflineMiss);
        assert!(engine.wait_for_prefetch().await.is_none());
        assert_eq!(engine.tile_stats().tiles, 0);

        engine.save_map_state(&MapViewState::new(CASA.0, CASA.1, 14, None));
        assert_eq!(engine.map_state().unwrap().zoom, 14);

        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (engine, mut rx, _probe) = start(dir.path(), true).await;
            engine.load_nearby(CASA.0, CASA.1);
            next_terminal(&mut rx).await;
            engine.shutdown().await;
        }

        let (engine, mut rx, _probe) = start(dir.path(), false).await;
        engine.load_nearby(CASA.0 + 0.0002, CASA.1);
        let LoadStatus::Success { records, source } = next_terminal(&mut rx).await else {
            panic!("expected cached success");
        };
        assert_eq!(source, ResultSource::Cache);
        assert_eq!(records[0].id, "p1");
        engine.shutdown().await;
    }
}
