//! Progressive data loading.
//!
//! Data for an owner is fetched in three stages: a critical minimum, the
//! full dataset, and optional enhancements run in the background. Stage
//! failures are classified, retried with backoff, and degraded gracefully
//! so partial data stays usable. Results can be cached in a bounded LRU+TTL
//! cache and requests debounced per key.

pub mod cache;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod loading;
pub mod logging;
pub mod scenario;
pub mod search;
