//! Bounded in-memory cache with LRU eviction and per-entry TTL.

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::{SharedClock, SystemClock};

pub const DEFAULT_MAX_SIZE: usize = 8;
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
  value: V,
  inserted_at: DateTime<Utc>,
}

struct Inner<V> {
  entries: LruCache<String, CacheEntry<V>>,
  hits: u64,
  misses: u64,
  evictions: u64,
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub size: usize,
  pub max_size: usize,
  /// Keys from least to most recently used
  pub entries: Vec<String>,
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
}

/// Capacity-limited key/value store.
///
/// Holds at most `max_size` entries. An entry is treated as absent once it is
/// `ttl` old, and a `get` makes the entry the most recently used.
pub struct BoundedCache<V> {
  inner: Mutex<Inner<V>>,
  max_size: NonZeroUsize,
  ttl: chrono::Duration,
  clock: SharedClock,
}

impl<V: Clone> BoundedCache<V> {
  pub fn new(max_size: usize, ttl: Duration) -> Self {
    Self::with_clock(max_size, ttl, Arc::new(SystemClock))
  }

  pub fn with_clock(max_size: usize, ttl: Duration, clock: SharedClock) -> Self {
    let max_size = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
    Self {
      inner: Mutex::new(Inner {
        entries: LruCache::new(max_size),
        hits: 0,
        misses: 0,
        evictions: 0,
      }),
      max_size,
      ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500)),
      clock,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner<V>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn get(&self, key: &str) -> Option<V> {
    let now = self.clock.now();
    let mut inner = self.lock();

    // `peek` leaves recency alone so an expired entry is not promoted.
    let expired = match inner.entries.peek(key) {
      None => {
        inner.misses += 1;
        return None;
      }
      Some(entry) => now - entry.inserted_at >= self.ttl,
    };
    if expired {
      inner.entries.pop(key);
      inner.misses += 1;
      tracing::debug!(key, "cache entry expired");
      return None;
    }

    inner.hits += 1;
    inner.entries.get(key).map(|entry| entry.value.clone())
  }

  pub fn set(&self, key: impl Into<String>, value: V) {
    let key = key.into();
    let entry = CacheEntry {
      value,
      inserted_at: self.clock.now(),
    };
    let mut inner = self.lock();

    if let Some((evicted, _)) = inner.entries.push(key.clone(), entry) {
      if evicted != key {
        inner.evictions += 1;
        tracing::debug!(key = %evicted, "evicted least recently used cache entry");
      }
    }
  }

  pub fn remove(&self, key: &str) -> Option<V> {
    self.lock().entries.pop(key).map(|entry| entry.value)
  }

  pub fn clear(&self) {
    self.lock().entries.clear();
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn max_size(&self) -> usize {
    self.max_size.get()
  }

  pub fn stats(&self) -> CacheStats {
    let inner = self.lock();
    CacheStats {
      size: inner.entries.len(),
      max_size: self.max_size.get(),
      entries: inner.entries.iter().rev().map(|(key, _)| key.clone()).collect(),
      hits: inner.hits,
      misses: inner.misses,
      evictions: inner.evictions,
    }
  }
}

impl<V: Clone> Default for BoundedCache<V> {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_SIZE, DEFAULT_TTL)
  }
}
