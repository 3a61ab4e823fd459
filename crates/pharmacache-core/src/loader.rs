//! Nearby-pharmacy loading with cache fallback and bounded retries.
//!
//! A load runs as a session: `Loading`, then either `Success`, a few
//! `Retrying` rounds, or `Exhausted`. Starting a new load supersedes the
//! current session; its timer is cancelled and any result that arrives for
//! it later is dropped without touching the cache.
//!
//! Progress is published as [`LoadUpdate`]s on an unbounded channel. The
//! receiver is free to hop threads; nothing here is thread-affine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{ApiError, PharmacyFetcher};
use crate::cache::CacheManager;
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::models::{rank_by_distance, LocationKey, PharmacyRecord};

/// How often the stall watchdog looks at the current session.
const WATCHDOG_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    Cache,
    Live,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Loading,
    /// `attempt` is the fetch now being issued, counting the first one.
    Retrying { attempt: u32, max_attempts: u32 },
    Success {
        records: Vec<PharmacyRecord>,
        source: ResultSource,
    },
    /// Offline and nothing cached for the key.
    OfflineMiss,
    Exhausted { attempts: u32, message: String },
}

impl LoadStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoadStatus::Loading | LoadStatus::Retrying { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadUpdate {
    pub session: SessionId,
    pub key: LocationKey,
    pub status: LoadStatus,
}

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub radius_m: u32,
    pub max_markers: usize,
    pub fetch_workers: usize,
    /// Stall threshold; `None` disables the watchdog.
    pub watchdog: Option<Duration>,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(2),
            radius_m: 5000,
            max_markers: 100,
            fetch_workers: 2,
            watchdog: None,
        }
    }
}

impl From<&Config> for LoaderSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            radius_m: config.search_radius(None),
            max_markers: config.max_markers,
            fetch_workers: config.fetch_workers,
            watchdog: config.watchdog_enabled.then(|| config.watchdog_threshold()),
        }
    }
}

struct Session {
    id: SessionId,
    key: LocationKey,
    lat: f64,
    lon: f64,
    /// Retries issued so far.
    attempt: u32,
    live: bool,
    /// Start of the session or of its latest retry.
    last_progress: Instant,
    restarted: bool,
    timer: Option<JoinHandle<()>>,
}

impl Session {
    fn finish(&mut self) {
        self.live = false;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Shared {
    cache: Arc<CacheManager>,
    connectivity: Arc<ConnectivityMonitor>,
    fetcher: Arc<dyn PharmacyFetcher>,
    settings: LoaderSettings,
    updates: mpsc::UnboundedSender<LoadUpdate>,
    next_session: AtomicU64,
    /// Lock order: `session` before `tasks`.
    session: Mutex<Option<Session>>,
    tasks: Mutex<JoinSet<()>>,
    permits: Semaphore,
    closed: AtomicBool,
}

pub struct NearbyLoader {
    shared: Arc<Shared>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl NearbyLoader {
    /// Must be called from within a tokio runtime when the watchdog is on.
    pub fn new(
        cache: Arc<CacheManager>,
        connectivity: Arc<ConnectivityMonitor>,
        fetcher: Arc<dyn PharmacyFetcher>,
        settings: LoaderSettings,
        updates: mpsc::UnboundedSender<LoadUpdate>,
    ) -> Self {
        let shared = Arc::new(Shared {
            cache,
            connectivity,
            fetcher,
            permits: Semaphore::new(settings.fetch_workers.max(1)),
            settings,
            updates,
            next_session: AtomicU64::new(1),
            session: Mutex::new(None),
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        });

        let watchdog = shared
            .settings
            .watchdog
            .map(|threshold| Shared::spawn_watchdog(&shared, threshold));

        Self {
            shared,
            watchdog: Mutex::new(watchdog),
        }
    }

    pub fn load_nearby(&self, lat: f64, lon: f64) -> SessionId {
        self.load_nearby_key(LocationKey::from_coords(lat, lon), lat, lon)
    }

    /// Start a load for `key`, superseding whatever is in flight.
    /// `(lat, lon)` is the exact query point used for the fetch and for
    /// distances.
    pub fn load_nearby_key(&self, key: LocationKey, lat: f64, lon: f64) -> SessionId {
        let shared = &self.shared;
        let id = shared.next_session.fetch_add(1, Ordering::SeqCst);

        let mut current = shared.session.lock();
        if let Some(mut old) = current.take() {
            if old.live {
                debug!(old = old.id, new = id, "Superseding load");
            }
            old.finish();
        }

        if shared.closed.load(Ordering::SeqCst) {
            warn!(session = id, "Loader is shut down, ignoring load");
            return id;
        }

        shared.send(id, &key, LoadStatus::Loading);

        if shared.connectivity.is_offline() {
            match shared.cached(&key, lat, lon) {
                Some(records) => {
                    info!(session = id, key = %key, count = records.len(), "Offline, serving cached pharmacies");
                    shared.send(id, &key, LoadStatus::Success {
                        records,
                        source: ResultSource::Cache,
                    });
                }
                None => {
                    info!(session = id, key = %key, "Offline and nothing cached");
                    shared.send(id, &key, LoadStatus::OfflineMiss);
                }
            }
            return id;
        }

        if let Some(records) = shared.cached(&key, lat, lon) {
            info!(session = id, key = %key, count = records.len(), "Serving cached pharmacies, revalidating");
            shared.send(id, &key, LoadStatus::Success {
                records,
                source: ResultSource::Cache,
            });
            shared.spawn_revalidate(key, lat, lon);
            return id;
        }

        info!(session = id, key = %key, "No cached pharmacies, fetching");
        *current = Some(Session {
            id,
            key,
            lat,
            lon,
            attempt: 0,
            live: true,
            last_progress: Instant::now(),
            restarted: false,
            timer: Some(shared.spawn_timer(id)),
        });
        shared.spawn_fetch(id, lat, lon);
        id
    }

    /// The session still waiting for a result, if any.
    pub fn active_session(&self) -> Option<SessionId> {
        self.shared
            .session
            .lock()
            .as_ref()
            .filter(|s| s.live)
            .map(|s| s.id)
    }

    pub fn is_loading(&self) -> bool {
        self.active_session().is_some()
    }

    /// Stop the watchdog and the retry timer and refuse new loads.
    /// In-flight fetches keep running until [`NearbyLoader::drain`].
    pub fn cancel_timers(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }
        if let Some(mut session) = self.shared.session.lock().take() {
            session.finish();
        }
    }

    /// Wait up to `grace` for in-flight fetches, then abort the rest.
    pub async fn drain(&self, grace: Duration) {
        self.shared.permits.close();
        let mut tasks = std::mem::take(&mut *self.shared.tasks.lock());
        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            warn!(remaining = tasks.len(), "Fetch pool did not drain in time, aborting");
            tasks.abort_all();
        }
    }

    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down nearby loader");
        self.cancel_timers();
        self.drain(grace).await;
    }
}

impl Drop for NearbyLoader {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.get_mut().take() {
            watchdog.abort();
        }
        if let Some(mut session) = self.shared.session.lock().take() {
            session.finish();
        }
    }
}

impl Shared {
    fn send(&self, session: SessionId, key: &LocationKey, status: LoadStatus) {
        let update = LoadUpdate {
            session,
            key: key.clone(),
            status,
        };
        if self.updates.send(update).is_err() {
            debug!(session, "No receiver for load updates");
        }
    }

    fn is_live(&self, id: SessionId) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.id == id && s.live)
    }

    /// Non-empty cached records for `key`, ranked from `(lat, lon)`.
    fn cached(&self, key: &LocationKey, lat: f64, lon: f64) -> Option<Vec<PharmacyRecord>> {
        let mut records = self.cache.get_pharmacies_for_key(key)?;
        if records.is_empty() {
            return None;
        }
        rank_by_distance(&mut records, lat, lon);
        Some(records)
    }

    fn finalize(&self, mut records: Vec<PharmacyRecord>, lat: f64, lon: f64) -> Vec<PharmacyRecord> {
        rank_by_distance(&mut records, lat, lon);
        records.truncate(self.settings.max_markers);
        records
    }

    fn spawn_fetch(self: &Arc<Self>, id: SessionId, lat: f64, lon: f64) {
        let shared = Arc::clone(self);
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let Ok(_permit) = shared.permits.acquire().await else {
                return;
            };
            if !shared.is_live(id) {
                debug!(session = id, "Session ended before fetch started");
                return;
            }
            let result = shared.fetcher.fetch(lat, lon, shared.settings.radius_m).await;
            shared.on_fetch_result(id, lat, lon, result);
        });
    }

    fn on_fetch_result(&self, id: SessionId, lat: f64, lon: f64, result: Result<Vec<PharmacyRecord>, ApiError>) {
        let records = match result {
            Ok(records) if records.is_empty() => {
                info!(session = id, "Fetch returned no pharmacies, waiting for retry");
                return;
            }
            Ok(records) => records,
            Err(e) => {
                warn!(session = id, error = %e, "Fetch failed, waiting for retry");
                return;
            }
        };

        let mut current = self.session.lock();
        let Some(session) = current.as_mut().filter(|s| s.id == id && s.live) else {
            debug!(session = id, "Discarding result for superseded session");
            return;
        };
        session.finish();

        let records = self.finalize(records, lat, lon);
        self.cache.put_pharmacies_for_key(&session.key, &records);
        info!(session = id, count = records.len(), "Loaded pharmacies");
        self.send(id, &session.key, LoadStatus::Success {
            records,
            source: ResultSource::Live,
        });
    }

    fn spawn_revalidate(self: &Arc<Self>, key: LocationKey, lat: f64, lon: f64) {
        let shared = Arc::clone(self);
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let Ok(_permit) = shared.permits.acquire().await else {
                return;
            };
            match shared.fetcher.fetch(lat, lon, shared.settings.radius_m).await {
                Ok(records) if !records.is_empty() => {
                    let records = shared.finalize(records, lat, lon);
                    shared.cache.put_pharmacies_for_key(&key, &records);
                    debug!(key = %key, count = records.len(), "Refreshed cached pharmacies");
                }
                Ok(_) => debug!(key = %key, "Refresh returned nothing, keeping cached pharmacies"),
                Err(e) => warn!(key = %key, error = %e, "Background refresh failed"),
            }
        });
    }

    fn spawn_timer(self: &Arc<Self>, id: SessionId) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        let delay = self.settings.retry_delay;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                if !shared.on_timeout(id) {
                    break;
                }
            }
        })
    }

    /// Returns whether the timer should run another round.
    fn on_timeout(self: &Arc<Self>, id: SessionId) -> bool {
        let mut current = self.session.lock();
        let Some(session) = current.as_mut().filter(|s| s.id == id && s.live) else {
            return false;
        };

        let max_retries = self.settings.max_retries;
        let max_attempts = max_retries + 1;
        session.attempt += 1;

        if session.attempt <= max_retries {
            let attempt = session.attempt + 1;
            session.last_progress = Instant::now();
            info!(session = id, attempt, max_attempts, "Still loading, retrying");
            self.send(id, &session.key, LoadStatus::Retrying { attempt, max_attempts });
            self.spawn_fetch(id, session.lat, session.lon);
            true
        } else {
            // Running inside this timer; drop the handle instead of aborting
            session.live = false;
            session.timer = None;
            warn!(session = id, attempts = max_attempts, "Giving up on pharmacy load");
            self.send(id, &session.key, LoadStatus::Exhausted {
                attempts: max_attempts,
                message: format!("No pharmacies found after {} attempts", max_attempts),
            });
            false
        }
    }

    fn spawn_watchdog(self: &Arc<Self>, threshold: Duration) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        info!(threshold_ms = threshold.as_millis() as u64, "Load watchdog enabled");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.restart_if_stalled(threshold);
            }
        })
    }

    /// A session with no fetch issued for longer than `threshold` is
    /// restarted from its first attempt, once.
    fn restart_if_stalled(self: &Arc<Self>, threshold: Duration) {
        let mut current = self.session.lock();
        let Some(session) = current.as_mut() else {
            return;
        };
        if !session.live || session.restarted || session.last_progress.elapsed() < threshold {
            return;
        }

        warn!(session = session.id, "Load appears stalled, restarting");
        session.restarted = true;
        session.attempt = 0;
        session.last_progress = Instant::now();
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        session.timer = Some(self.spawn_timer(session.id));
        self.send(session.id, &session.key, LoadStatus::Loading);
        self.spawn_fetch(session.id, session.lat, session.lon);
    }
}
