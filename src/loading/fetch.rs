//! Injected per-stage fetch functions.
//!
//! The network layer is opaque to the pipeline: each stage is backed by a
//! closure that receives a [`StageRequest`] and returns a boxed future.
//!
//! ```ignore
//! let fetchers = StageFetchers::new(fetcher(|req: StageRequest| async move {
//!     api.load_summary(&req.owner).await.map(StageResponse::data)
//! }))
//! .with_full(fetcher(|req: StageRequest| async move {
//!     api.load_details(&req.owner).await.map(StageResponse::data)
//! }));
//! ```

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

use super::cancel::CancellationToken;
use super::error::FetchError;
use super::stage::Stage;

/// Parameters handed to a stage fetcher.
#[derive(Debug, Clone)]
pub struct StageRequest {
  pub owner: String,
  pub stage: Stage,
  /// 0 for the initial fetch, then the retry number
  pub attempt: u32,
  /// Cancelled when the sequence is superseded; fetchers may watch it to
  /// abandon work early
  pub token: CancellationToken,
}

/// A fetch that completed without an exception. `data: None` is a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResponse<T> {
  pub data: Option<T>,
  pub message: Option<String>,
}

impl<T> StageResponse<T> {
  pub fn data(data: T) -> Self {
    Self {
      data: Some(data),
      message: None,
    }
  }

  pub fn missing(message: impl Into<String>) -> Self {
    Self {
      data: None,
      message: Some(message.into()),
    }
  }

  /// Treat a response without data as a failure carrying its message.
  pub fn into_data(self) -> Result<T, FetchError> {
    match self.data {
      Some(data) => Ok(data),
      None => Err(FetchError::Message(
        self.message.unwrap_or_else(|| "no data returned".to_string()),
      )),
    }
  }
}

pub type StageResult<T> = Result<StageResponse<T>, FetchError>;

/// A factory for stage fetch futures.
pub type FetcherFn<T> = Arc<dyn Fn(StageRequest) -> BoxFuture<'static, StageResult<T>> + Send + Sync>;

/// Box a closure into a [`FetcherFn`].
pub fn fetcher<T, F, Fut>(f: F) -> FetcherFn<T>
where
  F: Fn(StageRequest) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = StageResult<T>> + Send + 'static,
{
  Arc::new(move |request| f(request).boxed())
}

/// One fetcher per stage. `critical` is mandatory.
pub struct StageFetchers<T> {
  critical: FetcherFn<T>,
  full: Option<FetcherFn<T>>,
  enhancement: Option<FetcherFn<T>>,
}

impl<T> StageFetchers<T> {
  pub fn new(critical: FetcherFn<T>) -> Self {
    Self {
      critical,
      full: None,
      enhancement: None,
    }
  }

  pub fn with_full(mut self, full: FetcherFn<T>) -> Self {
    self.full = Some(full);
    self
  }

  pub fn with_enhancement(mut self, enhancement: FetcherFn<T>) -> Self {
    self.enhancement = Some(enhancement);
    self
  }

  /// Stages that have a fetcher, in run order.
  pub fn stages(&self) -> Vec<Stage> {
    Stage::ALL
      .into_iter()
      .filter(|stage| self.get(*stage).is_some())
      .collect()
  }

  pub fn get(&self, stage: Stage) -> Option<&FetcherFn<T>> {
    match stage {
      Stage::Critical => Some(&self.critical),
      Stage::Full => self.full.as_ref(),
      Stage::Enhancement => self.enhancement.as_ref(),
    }
  }
}

impl<T> Clone for StageFetchers<T> {
  fn clone(&self) -> Self {
    Self {
      critical: Arc::clone(&self.critical),
      full: self.full.clone(),
      enhancement: self.enhancement.clone(),
    }
  }
}
