//! Pharmacy search client.
//!
//! The loader only sees the `PharmacyFetcher` trait; `OverpassClient`
//! is the production implementation, querying OpenStreetMap data for
//! `amenity=pharmacy` nodes and building outlines.

pub mod client;
pub mod error;

pub use client::{parse_pharmacies, OverpassClient, PharmacyFetcher};
pub use error::ApiError;
