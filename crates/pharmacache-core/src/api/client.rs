//! Nearby-pharmacy search against the Overpass API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::ApiError;
use crate::config::Config;
use crate::models::{rank_by_distance, PharmacyRecord};

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Server-side query timeout passed to Overpass.
const QUERY_TIMEOUT_SECS: u32 = 25;

/// Source of pharmacy records around a point.
///
/// An empty list and an error both mean "no usable result" to the loader;
/// the difference only shows up in logs.
#[async_trait]
pub trait PharmacyFetcher: Send + Sync {
    async fn fetch(&self, lat: f64, lon: f64, radius_m: u32) -> Result<Vec<PharmacyRecord>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<Element>,
}

#[derive(Debug, Deserialize)]
struct Element {
    #[serde(rename = "type")]
    kind: String,
    id: i64,
    lat: Option<f64>,
    lon: Option<f64>,
    tags: Option<HashMap<String, String>>,
    #[serde(default)]
    geometry: Vec<GeometryPoint>,
}

#[derive(Debug, Deserialize)]
struct GeometryPoint {
    lat: f64,
    lon: f64,
}

/// Overpass client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct OverpassClient {
    client: Client,
    endpoint: String,
    max_markers: usize,
}

impl OverpassClient {
    pub fn new(endpoint: impl Into<String>, user_agent: &str, max_markers: usize) -> Result<Self, ApiError> {
        let mut headers = header::HeaderMap::new();
        if let Ok(value) = header::HeaderValue::from_str(user_agent) {
            headers.insert(header::USER_AGENT, value);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            max_markers,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::new(config.overpass_url.clone(), &config.user_agent, config.max_markers)
    }

    pub fn build_query(lat: f64, lon: f64, radius_m: u32) -> String {
        format!(
            "[out:json][timeout:{t}];\
             (node[\"amenity\"=\"pharmacy\"](around:{r},{lat:.6},{lon:.6});\
             way[\"amenity\"=\"pharmacy\"](around:{r},{lat:.6},{lon:.6}););\
             out body geom;>;out skel qt;",
            t = QUERY_TIMEOUT_SECS,
            r = radius_m,
            lat = lat,
            lon = lon,
        )
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }
}

#[async_trait]
impl PharmacyFetcher for OverpassClient {
    async fn fetch(&self, lat: f64, lon: f64, radius_m: u32) -> Result<Vec<PharmacyRecord>, ApiError> {
        info!(lat, lon, radius_m, "Fetching nearby pharmacies");
        let query = Self::build_query(lat, lon, radius_m);

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("data", query.as_str())])
            .send()
            .await?;
        let body = Self::check_response(response).await?.text().await?;

        let records = parse_pharmacies(&body, lat, lon, self.max_markers)?;
        info!(count = records.len(), "Found pharmacies");
        Ok(records)
    }
}

/// Turn an Overpass JSON document into records ranked by distance from
/// `(lat, lon)`, keeping at most `max_markers`.
///
/// Elements without tags (the skeleton nodes of ways) are ignored, as are
/// malformed ones.
pub fn parse_pharmacies(
    body: &str,
    lat: f64,
    lon: f64,
    max_markers: usize,
) -> Result<Vec<PharmacyRecord>, ApiError> {
    let response: OverpassResponse = serde_json::from_str(body)
        .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse Overpass response: {}", e)))?;

    let mut records: Vec<PharmacyRecord> = response
        .elements
        .into_iter()
        .filter_map(|element| {
            let id = element.id;
            let record = match element.kind.as_str() {
                "node" => parse_node(element),
                "way" => parse_way(element),
                _ => return None,
            };
            if record.is_none() {
                debug!(id, "Skipping element");
            }
            record
        })
        .collect();

    rank_by_distance(&mut records, lat, lon);
    if records.len() > max_markers {
        debug!(total = records.len(), max_markers, "Truncating results");
        records.truncate(max_markers);
    }
    Ok(records)
}

fn parse_node(element: Element) -> Option<PharmacyRecord> {
    let tags = element.tags?;
    let (Some(lat), Some(lon)) = (element.lat, element.lon) else {
        warn!(id = element.id, "Pharmacy node without coordinates");
        return None;
    };
    Some(with_tags(PharmacyRecord::new(element.id.to_string(), tags.get("name").cloned(), lat, lon), tags))
}

/// Ways are building outlines; the marker goes at the mean of the outline.
fn parse_way(element: Element) -> Option<PharmacyRecord> {
    let tags = element.tags?;
    if element.geometry.is_empty() {
        warn!(id = element.id, "Pharmacy way without geometry");
        return None;
    }
    let n = element.geometry.len() as f64;
    let center_lat = element.geometry.iter().map(|p| p.lat).sum::<f64>() / n;
    let center_lon = element.geometry.iter().map(|p| p.lon).sum::<f64>() / n;

    let mut record = PharmacyRecord::new(element.id.to_string(), tags.get("name").cloned(), center_lat, center_lon);
    record.geometry = element.geometry.iter().map(|p| [p.lat, p.lon]).collect();
    Some(with_tags(record, tags))
}

fn with_tags(mut record: PharmacyRecord, tags: HashMap<String, String>) -> PharmacyRecord {
    record.address = build_address(&tags);
    record.phone = tags.get("phone").cloned();
    record.opening_hours = tags.get("opening_hours").cloned();
    record.tags = tags;
    record
}

/// "12 Rue X, Casablanca"; `None` when no address tag is present.
fn build_address(tags: &HashMap<String, String>) -> Option<String> {
    let part = |key: &str| tags.get(key).map(String::as_str).unwrap_or("");
    let mut address = format!("{} {}", part("addr:housenumber"), part("addr:street"))
        .trim()
        .to_string();
    let city = part("addr:city");
    if !city.is_empty() {
        address.push_str(", ");
        address.push_str(city);
    }
    (!address.is_empty()).then_some(address)
}
