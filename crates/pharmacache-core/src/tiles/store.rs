//! On-disk tile cache and background prefetcher.
//!
//! Tiles live at `<root>/<zoom>/<x>/<y>.png`. The filesystem is the only
//! index: a tile is cached exactly when its file exists. Files are written
//! through a `.tmp` sibling and renamed, so a present file is always complete.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::source::{HttpTileSource, TileError, TileSource};
use crate::config::Config;
use crate::models::tile::MAX_ZOOM;
use crate::models::TileCoordinate;

/// Log progress every this many downloaded tiles.
const PROGRESS_LOG_INTERVAL: usize = 50;

/// Neighbourhood radius at the lowest prefetch zoom; shrinks by one per level.
const BASE_RADIUS: u32 = 6;

#[derive(Debug, Clone)]
pub struct PrefetchSettings {
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// Pause after each network download, per the provider's usage policy.
    pub delay: Duration,
    pub workers: usize,
}

impl Default for PrefetchSettings {
    fn default() -> Self {
        Self {
            min_zoom: 12,
            max_zoom: 16,
            delay: Duration::from_millis(100),
            workers: 2,
        }
    }
}

impl From<&Config> for PrefetchSettings {
    fn from(config: &Config) -> Self {
        Self {
            min_zoom: config.tile_min_zoom,
            max_zoom: config.tile_max_zoom,
            delay: config.tile_download_delay(),
            workers: config.tile_download_workers,
        }
    }
}

impl PrefetchSettings {
    /// More detail needs fewer tiles for the same ground coverage.
    pub fn radius_for(&self, zoom: u8) -> u32 {
        let steps = u32::from(zoom.saturating_sub(self.min_zoom));
        BASE_RADIUS.saturating_sub(steps).max(1)
    }
}

/// Outcome of one prefetch batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub planned: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchProgress {
    pub planned: usize,
    pub done: usize,
}

impl PrefetchProgress {
    pub fn fraction(&self) -> f64 {
        if self.planned == 0 {
            0.0
        } else {
            self.done as f64 / self.planned as f64
        }
    }
}

/// Clears the in-progress flag however the job ends (including abort).
struct DownloadingGuard(Arc<AtomicBool>);

impl Drop for DownloadingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct TileStore {
    root: PathBuf,
    source: Arc<dyn TileSource>,
    settings: PrefetchSettings,
    permits: Arc<Semaphore>,
    downloading: Arc<AtomicBool>,
    planned: AtomicUsize,
    done: AtomicUsize,
    shutdown: CancellationToken,
    job: Mutex<CancellationToken>,
}

impl TileStore {
    pub fn new(root: PathBuf, source: Arc<dyn TileSource>, settings: PrefetchSettings) -> Self {
        if let Err(e) = std::fs::create_dir_all(&root) {
            error!(dir = %root.display(), error = %e, "Failed to create tile cache directory");
        }
        let shutdown = CancellationToken::new();
        Self {
            root,
            source,
            permits: Arc::new(Semaphore::new(settings.workers.max(1))),
            settings,
            downloading: Arc::new(AtomicBool::new(false)),
            planned: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            job: Mutex::new(shutdown.child_token()),
            shutdown,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let source = HttpTileSource::new(config.tile_url_template.clone(), &config.user_agent)?;
        Ok(Self::new(
            config.tile_dir()?,
            Arc::new(source),
            PrefetchSettings::from(config),
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tile_path(&self, tile: TileCoordinate) -> PathBuf {
        self.root.join(tile.relative_path())
    }

    pub fn is_tile_cached(&self, tile: TileCoordinate) -> bool {
        tile.is_valid() && self.tile_path(tile).is_file()
    }

    /// Raw bytes of a cached tile. Out-of-grid coordinates and read errors
    /// are both a miss.
    pub async fn get_cached_tile(&self, zoom: u8, x: u32, y: u32) -> Option<Vec<u8>> {
        let tile = TileCoordinate::new(zoom, x, y);
        if !tile.is_valid() {
            return None;
        }
        match tokio::fs::read(self.tile_path(tile)).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                error!(%tile, error = %e, "Error reading cached tile");
                None
            }
        }
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> PrefetchProgress {
        PrefetchProgress {
            planned: self.planned.load(Ordering::SeqCst),
            done: self.done.load(Ordering::SeqCst),
        }
    }

    /// Every tile a prefetch around `(lat, lon)` would visit, zoom by zoom.
    /// Zoom levels past [`MAX_ZOOM`] are left out.
    pub fn plan(&self, lat: f64, lon: f64) -> Vec<TileCoordinate> {
        (self.settings.min_zoom..=self.settings.max_zoom.min(MAX_ZOOM))
            .flat_map(|zoom| {
                TileCoordinate::from_lat_lon(lat, lon, zoom).neighbourhood(self.settings.radius_for(zoom))
            })
            .collect()
    }

    /// Start a background prefetch around `(lat, lon)`.
    ///
    /// Returns `None` without queueing anything when a batch is already
    /// running.
    pub fn pre_cache_tiles_around_location(
        self: &Arc<Self>,
        lat: f64,
        lon: f64,
    ) -> Option<JoinHandle<PrefetchReport>> {
        if self
            .downloading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Tile download already in progress, skipping");
            return None;
        }
        let guard = DownloadingGuard(Arc::clone(&self.downloading));

        let token = self.shutdown.child_token();
        *self.job.lock() = token.clone();

        let tiles = self.plan(lat, lon);
        self.planned.store(tiles.len(), Ordering::SeqCst);
        self.done.store(0, Ordering::SeqCst);
        info!(lat, lon, tiles = tiles.len(), "Starting tile pre-cache");

        let store = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _guard = guard;
            let report = store.run_batch(tiles, token).await;
            info!(
                downloaded = report.downloaded,
                skipped = report.skipped,
                failed = report.failed,
                cancelled = report.cancelled,
                "Tile pre-cache finished"
            );
            report
        }))
    }

    async fn run_batch(&self, tiles: Vec<TileCoordinate>, token: CancellationToken) -> PrefetchReport {
        let mut report = PrefetchReport {
            planned: tiles.len(),
            ..PrefetchReport::default()
        };

        for tile in tiles {
            // Cancellation is only observed between tiles, never mid-download
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }

            if self.is_tile_cached(tile) {
                report.skipped += 1;
                self.done.fetch_add(1, Ordering::SeqCst);
                continue;
            }

            let Ok(_permit) = self.permits.acquire().await else {
                report.cancelled = true;
                break;
            };

            match self.download(tile).await {
                Ok(()) => {
                    report.downloaded += 1;
                    if report.downloaded % PROGRESS_LOG_INTERVAL == 0 {
                        info!(downloaded = report.downloaded, "Downloaded tiles so far");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(%tile, error = %e, "Failed to download tile, skipping");
                }
            }
            self.done.fetch_add(1, Ordering::SeqCst);

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(self.settings.delay) => {}
            }
        }

        report
    }

    async fn download(&self, tile: TileCoordinate) -> Result<(), TileError> {
        let bytes = self.source.fetch(tile).await?;
        if bytes.is_empty() {
            return Err(TileError::Empty(tile));
        }
        self.write_tile(tile, &bytes).await?;
        debug!(%tile, bytes = bytes.len(), "Tile cached");
        Ok(())
    }

    async fn write_tile(&self, tile: TileCoordinate, bytes: &[u8]) -> std::io::Result<()> {
        let path = self.tile_path(tile);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("png.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop the running batch after its current tile.
    pub fn cancel(&self) {
        self.job.lock().cancel();
    }

    /// Cancel the running batch and refuse further downloads.
    pub fn shutdown(&self) {
        info!("Shutting down tile store");
        self.shutdown.cancel();
        self.permits.close();
    }

    pub fn cached_tile_count(&self) -> u64 {
        let mut count = 0;
        walk_files(&self.root, &mut |path, _| {
            if path.extension().is_some_and(|ext| ext == "png") {
                count += 1;
            }
        });
        count
    }

    pub fn cache_size_bytes(&self) -> u64 {
        let mut total = 0;
        walk_files(&self.root, &mut |_, len| total += len);
        total
    }

    /// Delete every cached tile. Errors on individual entries are logged.
    pub fn clear_cache(&self) {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Error clearing tile cache");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = result {
                error!(path = %path.display(), error = %e, "Error deleting tile entry");
            }
        }
        info!("Tile cache cleared");
    }
}

fn walk_files(dir: &Path, visit: &mut dyn FnMut(&Path, u64)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.metadata() {
            Ok(meta) if meta.is_dir() => walk_files(&path, visit),
            Ok(meta) if meta.is_file() => visit(&path, meta.len()),
            _ => {}
        }
    }
}
