//! Cache keys and cache-aware result types.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::loading::Stage;

/// A logical key that maps onto a cache slot.
pub trait CacheKey {
  /// Stable, fixed-length key used for storage.
  fn cache_hash(&self) -> String;

  /// Human-readable description for logs.
  fn description(&self) -> String;
}

impl CacheKey for str {
  fn cache_hash(&self) -> String {
    self.to_string()
  }

  fn description(&self) -> String {
    self.to_string()
  }
}

impl CacheKey for String {
  fn cache_hash(&self) -> String {
    self.clone()
  }

  fn description(&self) -> String {
    self.clone()
  }
}

/// SHA-256 hex digest of `input`.
pub fn digest(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Key for one stage's data for one owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageKey {
  pub stage: Stage,
  pub owner: String,
}

impl StageKey {
  pub fn new(stage: Stage, owner: impl Into<String>) -> Self {
    Self {
      stage,
      owner: owner.into(),
    }
  }
}

impl CacheKey for StageKey {
  fn cache_hash(&self) -> String {
    digest(&format!("stage:{}:{}", self.stage, self.owner.trim()))
  }

  fn description(&self) -> String {
    format!("{} data for {}", self.stage, self.owner)
  }
}

/// Result from a cache-first lookup, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was fetched from the network (if it was)
  pub fetched_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at: Some(fetched_at),
    }
  }

  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      fetched_at: None,
    }
  }

  pub fn is_cached(&self) -> bool {
    self.source == CacheSource::Cache
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the network
  Network,
  /// Served from the bounded cache
  Cache,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_stage_key_hash_is_stable() {
    let a = StageKey::new(Stage::Full, "acme/widgets");
    let b = StageKey::new(Stage::Full, " acme/widgets ");
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_eq!(a.cache_hash().len(), 64);
    assert_ne!(
      a.cache_hash(),
      StageKey::new(Stage::Critical, "acme/widgets").cache_hash()
    );
  }

  #[test]
  fn test_description() {
    let key = StageKey::new(Stage::Enhancement, "acme");
    assert_eq!(key.description(), "enhancement data for acme");
  }
}
