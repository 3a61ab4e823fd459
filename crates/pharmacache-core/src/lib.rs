//! pharmacache-core - offline-resilient cache and sync engine for nearby
//! pharmacy results and map tiles.
//!
//! This crate contains the engine with no presentation code:
//! - Expiring, disk-mirrored caches for results, user location and map view
//! - Connectivity monitoring with change-only notifications
//! - Map tile storage, background prefetch and a loopback tile origin
//! - A loader that falls back to cache and retries with a bounded budget
//! - Configuration management

pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod loader;
pub mod models;
pub mod tiles;

pub use config::Config;
pub use engine::{Collaborators, Engine, TileStats};
