//! Bounded result caching.
//!
//! This module provides:
//! - An in-memory LRU cache with per-entry time-to-live
//! - Stable hashed keys for stage and search results
//! - A cache-first fetch layer and a caching decorator for stage fetchers

mod layer;
mod lru;
mod traits;

pub use layer::{cached_stage_fetcher, CacheLayer};
pub use lru::{BoundedCache, CacheStats, DEFAULT_MAX_SIZE, DEFAULT_TTL};
pub use traits::{digest, CacheKey, CacheResult, CacheSource, StageKey};
