//! Cache-first fetching on top of [`BoundedCache`].

use std::future::Future;
use std::sync::Arc;

use super::lru::BoundedCache;
use super::traits::{CacheKey, CacheResult, StageKey};
use crate::clock::{SharedClock, SystemClock};
use crate::loading::{fetcher, FetcherFn, StageRequest, StageResponse};

/// Consults the cache before calling the network.
///
/// Only successful fetches are stored, so a failure is retried against the
/// network on the next call.
pub struct CacheLayer<V> {
  cache: Arc<BoundedCache<V>>,
  clock: SharedClock,
}

impl<V: Clone> CacheLayer<V> {
  pub fn new(cache: Arc<BoundedCache<V>>) -> Self {
    Self {
      cache,
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_clock(mut self, clock: SharedClock) -> Self {
    self.clock = clock;
    self
  }

  pub fn cache(&self) -> &Arc<BoundedCache<V>> {
    &self.cache
  }

  /// Return the cached value for `key`, or fetch and cache it.
  pub async fn fetch<K, F, Fut, E>(&self, key: &K, fetcher: F) -> Result<CacheResult<V>, E>
  where
    K: CacheKey + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
  {
    let hash = key.cache_hash();
    if let Some(cached) = self.cache.get(&hash) {
      tracing::debug!(key = %key.description(), "cache hit");
      return Ok(CacheResult::from_cache(cached));
    }

    let data = fetcher().await?;
    self.cache.set(hash, data.clone());
    Ok(CacheResult::from_network(data, self.clock.now()))
  }

  /// Drop the cached value for `key`, e.g. before a clear-cache retry.
  pub fn invalidate<K: CacheKey + ?Sized>(&self, key: &K) {
    self.cache.remove(&key.cache_hash());
  }
}

impl<V> Clone for CacheLayer<V> {
  fn clone(&self) -> Self {
    Self {
      cache: Arc::clone(&self.cache),
      clock: Arc::clone(&self.clock),
    }
  }
}

/// Wrap a stage fetcher so a warm cache entry short-circuits the network.
///
/// Entries are keyed by [`StageKey`]; responses without data are not cached.
pub fn cached_stage_fetcher<T>(cache: Arc<BoundedCache<T>>, inner: FetcherFn<T>) -> FetcherFn<T>
where
  T: Clone + Send + Sync + 'static,
{
  fetcher(move |request: StageRequest| {
    let cache = Arc::clone(&cache);
    let inner = Arc::clone(&inner);
    async move {
      let key = StageKey::new(request.stage, request.owner.clone()).cache_hash();
      if let Some(cached) = cache.get(&key) {
        tracing::debug!(owner = %request.owner, stage = %request.stage, "stage served from cache");
        return Ok(StageResponse::data(cached));
      }

      let response = inner(request).await?;
      if let Some(data) = &response.data {
        cache.set(key, data.clone());
      }
      Ok(response)
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::loading::{CancellationToken, FetchError, Stage};
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn request(stage: Stage, owner: &str) -> StageRequest {
    StageRequest {
      owner: owner.to_string(),
      stage,
      attempt: 0,
      token: CancellationToken::new(),
    }
  }

  #[tokio::test]
  async fn test_fetch_is_cache_first() {
    let layer = CacheLayer::new(Arc::new(BoundedCache::new(4, Duration::from_secs(60))));
    let calls = AtomicU32::new(0);

    for expected in [CacheSource::Network, CacheSource::Cache] {
      let result = layer
        .fetch("repo:acme", || async {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok::<_, String>(42)
        })
        .await
        .unwrap();
      assert_eq!(result.data, 42);
      assert_eq!(result.source, expected);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    layer.invalidate("repo:acme");
    assert!(layer.cache().is_empty());
  }

  #[tokio::test]
  async fn test_fetch_errors_are_not_cached() {
    let layer: CacheLayer<u32> = CacheLayer::new(Arc::new(BoundedCache::default()));
    let result = layer
      .fetch("k", || async { Err::<u32, _>("down".to_string()) })
      .await;
    assert!(result.is_err());
    assert!(layer.cache().is_empty());
  }

  #[tokio::test]
  async fn test_cached_stage_fetcher_skips_network_when_warm() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let inner = fetcher(move |req: StageRequest| {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          Ok(StageResponse::missing("timeout"))
        } else {
          Ok(StageResponse::data(format!("{}:{}", req.stage, req.owner)))
        }
      }
    });
    let cache = Arc::new(BoundedCache::new(4, Duration::from_secs(60)));
    let cached = cached_stage_fetcher(cache.clone(), inner);

    let first = cached(request(Stage::Full, "acme")).await.unwrap();
    assert!(first.data.is_none());
    assert!(cache.is_empty());

    for _ in 0..3 {
      let response = cached(request(Stage::Full, "acme")).await.unwrap();
      assert_eq!(response.data.as_deref(), Some("full:acme"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Different stage, different slot.
    cached(request(Stage::Critical, "acme")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_cached_stage_fetcher_propagates_errors() {
    let inner: FetcherFn<String> =
      fetcher(|_req: StageRequest| async { Err(FetchError::message("403")) });
    let cached = cached_stage_fetcher(Arc::new(BoundedCache::default()), inner);
    assert!(cached(request(Stage::Critical, "acme")).await.is_err());
  }
}
