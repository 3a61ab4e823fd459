//! Loopback HTTP origin serving cached tiles to a map renderer.
//!
//! `GET /tiles/{z}/{x}/{y}.png` answers from the [`TileStore`] and never
//! touches the network. The server runs on its own small runtime so that
//! map rendering keeps working whatever the rest of the engine is doing.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::TileStore;
use crate::config::Config;
use crate::models::TileCoordinate;

const TILE_PREFIX: &str = "/tiles/";
const TILE_CACHE_CONTROL: &str = "max-age=86400";

/// Longest `stop` waits for open connections before abandoning them.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum OriginError {
    #[error("Failed to bind tile origin on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start tile origin runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

struct Running {
    runtime: Runtime,
    addr: SocketAddr,
    shutdown: CancellationToken,
    /// Signalled once the server has returned and its listener is closed.
    finished: mpsc::Receiver<()>,
}

pub struct TileOrigin {
    store: Arc<TileStore>,
    port: u16,
    workers: usize,
    running: Mutex<Option<Running>>,
}

impl TileOrigin {
    /// Port 0 picks a free port; see [`TileOrigin::local_addr`].
    pub fn new(store: Arc<TileStore>, port: u16, workers: usize) -> Self {
        Self {
            store,
            port,
            workers: workers.max(1),
            running: Mutex::new(None),
        }
    }

    pub fn from_config(store: Arc<TileStore>, config: &Config) -> Self {
        Self::new(store, config.tile_origin_port, config.tile_origin_workers)
    }

    /// Bind 127.0.0.1 and start serving. Starting a running origin is a no-op.
    pub fn start(&self) -> Result<SocketAddr, OriginError> {
        let mut running = self.running.lock();
        if let Some(ref r) = *running {
            return Ok(r.addr);
        }

        let bind = |e: std::io::Error| {
            error!(port = self.port, error = %e, "Failed to start tile origin");
            OriginError::Bind {
                port: self.port,
                source: e,
            }
        };
        let std_listener =
            std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, self.port)).map_err(bind)?;
        std_listener.set_nonblocking(true).map_err(bind)?;
        let addr = std_listener.local_addr().map_err(bind)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.workers)
            .thread_name("tile-origin")
            .enable_all()
            .build()
            .map_err(OriginError::Runtime)?;

        let listener = {
            let _enter = runtime.enter();
            tokio::net::TcpListener::from_std(std_listener)
        };
        let listener = match listener {
            Ok(l) => l,
            Err(e) => {
                runtime.shutdown_background();
                return Err(bind(e));
            }
        };

        let app = Router::new()
            .fallback(serve_tile)
            .with_state(Arc::clone(&self.store));
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let (done, finished) = mpsc::channel();
        runtime.spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = server.await {
                error!(error = %e, "Tile origin stopped with error");
            }
            let _ = done.send(());
        });

        info!(%addr, "Tile origin started");
        *running = Some(Running {
            runtime,
            addr,
            shutdown,
            finished,
        });
        Ok(addr)
    }

    /// Stop serving and release the port. Idempotent.
    ///
    /// Blocks until the listener is closed, or for at most [`STOP_GRACE`]
    /// when clients keep connections busy.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.shutdown.cancel();
        if running.finished.recv_timeout(STOP_GRACE).is_err() {
            warn!(addr = %running.addr, "Tile origin connections still open, dropping them");
        }
        // Safe from inside another runtime, unlike dropping it
        running.runtime.shutdown_background();
        info!("Tile origin stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }

    /// URL template a renderer should use while offline.
    pub fn tile_url_template(&self) -> String {
        let port = self.local_addr().map(|a| a.port()).unwrap_or(self.port);
        format!("http://127.0.0.1:{}/tiles/{{z}}/{{x}}/{{y}}.png", port)
    }
}

impl Drop for TileOrigin {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Parse `/tiles/{z}/{x}/{y}.png`. Anything else, including negative or
/// out-of-grid coordinates, is `None`.
pub fn parse_tile_path(path: &str) -> Option<TileCoordinate> {
    let rest = path.strip_prefix(TILE_PREFIX)?;
    let mut parts = rest.split('/');
    let zoom = parts.next()?.parse::<u8>().ok()?;
    let x = parts.next()?.parse::<u32>().ok()?;
    let y = parts.next()?.strip_suffix(".png")?.parse::<u32>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let tile = TileCoordinate::new(zoom, x, y);
    tile.is_valid().then_some(tile)
}

async fn serve_tile(State(store): State<Arc<TileStore>>, method: Method, uri: Uri) -> Response {
    if method != Method::GET {
        return not_found();
    }
    let Some(tile) = parse_tile_path(uri.path()) else {
        debug!(path = uri.path(), "Invalid tile request");
        return not_found();
    };
    match store.get_cached_tile(tile.zoom, tile.x, tile.y).await {
        Some(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/png"),
                (header::CACHE_CONTROL, TILE_CACHE_CONTROL),
            ],
            bytes,
        )
            .into_response(),
        None => not_found(),
    }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain")],
        "Tile not found",
    )
        .into_response()
}
