//! Local caching module for offline data access.
//!
//! This module provides the `CacheManager` for storing and retrieving
//! search results locally. Each category is an in-memory concurrent map
//! mirrored to a JSON snapshot that is rewritten on every put and reloaded
//! (minus expired entries) at startup.
//!
//! Cached categories:
//! - Pharmacy results, keyed by `LocationKey` (24h by default)
//! - User location, single slot (24h by default)
//! - Map view state, single slot (7 days)

pub mod expiring;
pub mod manager;

pub use expiring::{CachedData, ExpiringCache};
pub use manager::{CacheCategory, CacheManager, CachePolicy, CacheStats};
