//! Progressive, staged data loading.
//!
//! A request sequence fetches one owner key's data in three ordered stages:
//!
//! - `critical`: mandatory; decides whether the resource exists at all
//! - `full`: the rest of the primary data
//! - `enhancement`: low-priority extras, run when the foreground is idle
//!
//! Failures are classified into a fixed taxonomy ([`ErrorKind`]), retried
//! with bounded linear backoff, and then either halt the sequence or let it
//! degrade gracefully into partial results. Starting a sequence for a new
//! owner cancels the previous one before anything else happens, and a
//! cancelled sequence never writes to the published state.

mod cancel;
mod degradation;
mod error;
mod fetch;
mod pipeline;
mod retry;
mod scheduler;
mod stage;
mod state;

pub use cancel::CancellationToken;
pub use degradation::{can_proceed_after, can_recover_in_next_stage, can_show_partial_data};
pub use error::{
  ErrorClassifier, ErrorKind, FetchError, KindConfig, LoadingError, RecoveryAction,
  RecoveryOption, RecoveryPriority,
};
pub use fetch::{fetcher, FetcherFn, StageFetchers, StageRequest, StageResponse, StageResult};
pub use pipeline::{PipelineBuilder, PipelineOptions, StagePipeline};
pub use retry::{RetryPlan, RetryPlanner, COUNTDOWN_THRESHOLD, MAX_RETRY_ATTEMPTS, MAX_RETRY_DELAY};
pub use scheduler::{
  for_host, ActivityGuard, ActivityTracker, BackgroundMode, BackgroundScheduler, IdleScheduler,
  TimerScheduler,
};
pub use stage::Stage;
pub use state::{Outcome, PendingRetry, Phase, ProgressiveState};
