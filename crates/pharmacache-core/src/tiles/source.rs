//! Upstream tile provider access.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use thiserror::Error;

use crate::models::TileCoordinate;

/// Per-request timeout for tile downloads.
/// Tiles are small; anything slower is better skipped than waited on.
const TILE_REQUEST_TIMEOUT_SECS: u64 = 5;

#[derive(Error, Debug)]
pub enum TileError {
    #[error("HTTP {status} for tile {tile}")]
    Status { tile: TileCoordinate, status: u16 },

    #[error("Empty response for tile {0}")]
    Empty(TileCoordinate),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that can produce the raw image bytes of a tile.
#[async_trait]
pub trait TileSource: Send + Sync {
    async fn fetch(&self, tile: TileCoordinate) -> Result<Vec<u8>, TileError>;
}

/// Fetches tiles from an HTTP provider using a `{z}/{x}/{y}` URL template.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTileSource {
    client: Client,
    url_template: String,
}

impl HttpTileSource {
    pub fn new(url_template: impl Into<String>, user_agent: &str) -> Result<Self, TileError> {
        let mut headers = header::HeaderMap::new();
        if let Ok(value) = header::HeaderValue::from_str(&format!("{} (offline caching)", user_agent)) {
            headers.insert(header::USER_AGENT, value);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(TILE_REQUEST_TIMEOUT_SECS))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }

    pub fn url_for(&self, tile: TileCoordinate) -> String {
        self.url_template
            .replace("{s}", "a")
            .replace("{z}", &tile.zoom.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.y.to_string())
    }
}

#[async_trait]
impl TileSource for HttpTileSource {
    async fn fetch(&self, tile: TileCoordinate) -> Result<Vec<u8>, TileError> {
        let response = self.client.get(self.url_for(tile)).send().await?;

        if !response.status().is_success() {
            return Err(TileError::Status {
                tile,
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(TileError::Empty(tile));
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_fills_template() {
        let source = HttpTileSource::new("https://{s}.tile.example.org/{z}/{x}/{y}.png", "test/1.0").unwrap();
        assert_eq!(
            source.url_for(TileCoordinate::new(13, 3923, 3284)),
            "https://a.tile.example.org/13/3923/3284.png"
        );
    }

    #[test]
    fn test_error_messages() {
        let err = TileError::Status {
            tile: TileCoordinate::new(1, 0, 1),
            status: 429,
        };
        assert_eq!(err.to_string(), "HTTP 429 for tile 1/0/1");
    }
}
