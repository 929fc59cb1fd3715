//! Debounced, cached search on top of [`BoundedCache`] and [`Debouncer`].

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

use crate::cache::{digest, BoundedCache, CacheKey};
use crate::debounce::Debouncer;
use crate::loading::FetchError;

/// Normalize a query for keying: trimmed, lowercased, single-spaced.
pub fn normalize_query(query: &str) -> String {
  query
    .split_whitespace()
    .map(str::to_lowercase)
    .collect::<Vec<_>>()
    .join(" ")
}

/// Cache key for a normalized search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchKey(String);

impl SearchKey {
  pub fn new(query: &str) -> Self {
    Self(normalize_query(query))
  }

  pub fn query(&self) -> &str {
    &self.0
  }
}

impl CacheKey for SearchKey {
  fn cache_hash(&self) -> String {
    digest(&format!("search:{}", self.0))
  }

  fn description(&self) -> String {
    format!("search: {}", self.0)
  }
}

/// What a call to [`SearchService::search`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome<V> {
  /// Query shorter than the configured minimum; nothing was fetched
  TooShort,
  Cached(V),
  Fetched(V),
  /// Coalesced into a trailing fetch; the result arrives via `updates`
  Deferred,
}

/// Latest completed search, published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchUpdate<V> {
  pub query: String,
  pub result: Result<V, String>,
}

type SearchFn<V> = Arc<dyn Fn(String) -> BoxFuture<'static, Result<V, FetchError>> + Send + Sync>;

struct Shared<V> {
  cache: Arc<BoundedCache<V>>,
  fetch: SearchFn<V>,
  latest_query: Mutex<String>,
  updates: watch::Sender<Option<SearchUpdate<V>>>,
}

impl<V: Clone + Send + Sync + 'static> Shared<V> {
  async fn run(self: Arc<Self>, key: SearchKey) -> Result<V, FetchError> {
    let result = (self.fetch)(key.query().to_string()).await;
    if let Ok(value) = &result {
      self.cache.set(key.cache_hash(), value.clone());
    }

    // A slower, superseded query must not overwrite the current results.
    let latest = self
      .latest_query
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    if latest == key.query() {
      self.updates.send_replace(Some(SearchUpdate {
        query: key.query().to_string(),
        result: result.as_ref().map(Clone::clone).map_err(ToString::to_string),
      }));
    } else {
      tracing::debug!(query = %key.query(), latest = %latest, "dropping stale search result");
    }
    result
  }
}

pub struct SearchService<V> {
  shared: Arc<Shared<V>>,
  debouncer: Debouncer,
  min_query_len: usize,
}

impl<V: Clone + Send + Sync + 'static> SearchService<V> {
  pub fn new<F, Fut>(
    cache: Arc<BoundedCache<V>>,
    debouncer: Debouncer,
    min_query_len: usize,
    fetch: F,
  ) -> Self
  where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let (updates, _rx) = watch::channel(None);
    Self {
      shared: Arc::new(Shared {
        cache,
        fetch: Arc::new(move |query| fetch(query).boxed()),
        latest_query: Mutex::new(String::new()),
        updates,
      }),
      debouncer,
      min_query_len,
    }
  }

  pub fn updates(&self) -> watch::Receiver<Option<SearchUpdate<V>>> {
    self.shared.updates.subscribe()
  }

  pub async fn search(&self, query: &str) -> Result<SearchOutcome<V>, FetchError> {
    let key = SearchKey::new(query);
    if key.query().chars().count() < self.min_query_len {
      return Ok(SearchOutcome::TooShort);
    }

    *self
      .shared
      .latest_query
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = key.query().to_string();

    if let Some(cached) = self.shared.cache.get(&key.cache_hash()) {
      self.shared.updates.send_replace(Some(SearchUpdate {
        query: key.query().to_string(),
        result: Ok(cached.clone()),
      }));
      return Ok(SearchOutcome::Cached(cached));
    }

    let shared = Arc::clone(&self.shared);
    let debounce_key = key.query().to_string();
    match self.debouncer.schedule(debounce_key, move || shared.run(key)) {
      Some(immediate) => immediate.await.map(SearchOutcome::Fetched),
      None => Ok(SearchOutcome::Deferred),
    }
  }

  /// Drop pending trailing searches.
  pub fn cancel_pending(&self) {
    self.debouncer.cleanup();
  }
}
