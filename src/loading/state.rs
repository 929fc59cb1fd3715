//! Per-sequence progress record published to subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::error::LoadingError;
use super::retry::RetryPlan;
use super::stage::Stage;

/// Where the controller is in the stage state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "stage", rename_all = "lowercase")]
pub enum Phase {
  Idle,
  Running(Stage),
  Settled(Outcome),
}

/// How a settled sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
  /// Every configured stage succeeded
  Complete,
  /// At least one stage failed but the sequence carried on
  Degraded,
  /// `critical` failed and blocked the rest of the sequence
  Failed,
}

/// A retry that has been scheduled but not yet fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRetry {
  pub attempt: u32,
  #[serde(with = "millis")]
  pub delay: Duration,
  pub fires_at: DateTime<Utc>,
  pub show_countdown: bool,
}

impl PendingRetry {
  pub fn new(plan: RetryPlan, now: DateTime<Utc>) -> Self {
    let delay = chrono::Duration::from_std(plan.delay).unwrap_or(chrono::Duration::zero());
    Self {
      attempt: plan.attempt,
      delay: plan.delay,
      fires_at: now + delay,
      show_countdown: plan.show_countdown,
    }
  }

  /// Time left before the retry fires, for countdown rendering.
  pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
    (self.fires_at - now).to_std().unwrap_or(Duration::ZERO)
  }
}

mod millis {
  use serde::Serializer;
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }
}

/// Progress of one request sequence for one owner key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressiveState<T> {
  pub owner: Option<String>,
  pub phase: Phase,
  pub stage_progress: BTreeMap<Stage, bool>,
  pub stage_errors: BTreeMap<Stage, Option<LoadingError>>,
  pub retry_attempts: BTreeMap<Stage, u32>,
  pub last_retry_time: BTreeMap<Stage, DateTime<Utc>>,
  pub pending_retries: BTreeMap<Stage, PendingRetry>,
  pub stage_data: BTreeMap<Stage, T>,
  pub has_partial_data: bool,
  pub current_stage: Option<Stage>,
  pub graceful_degradation: bool,
}

impl<T> ProgressiveState<T> {
  pub fn new(owner: Option<String>, graceful_degradation: bool) -> Self {
    let mut state = Self {
      owner,
      phase: Phase::Idle,
      stage_progress: BTreeMap::new(),
      stage_errors: BTreeMap::new(),
      retry_attempts: BTreeMap::new(),
      last_retry_time: BTreeMap::new(),
      pending_retries: BTreeMap::new(),
      stage_data: BTreeMap::new(),
      has_partial_data: false,
      current_stage: None,
      graceful_degradation,
    };
    for stage in Stage::ALL {
      state.stage_progress.insert(stage, false);
      state.stage_errors.insert(stage, None);
      state.retry_attempts.insert(stage, 0);
    }
    state
  }

  pub fn is_complete(&self, stage: Stage) -> bool {
    self.stage_progress.get(&stage).copied().unwrap_or(false)
  }

  pub fn error(&self, stage: Stage) -> Option<&LoadingError> {
    self.stage_errors.get(&stage).and_then(Option::as_ref)
  }

  pub fn attempts(&self, stage: Stage) -> u32 {
    self.retry_attempts.get(&stage).copied().unwrap_or(0)
  }

  pub fn data(&self, stage: Stage) -> Option<&T> {
    self.stage_data.get(&stage)
  }

  /// The error a consumer should surface first: the earliest failed stage.
  pub fn current_error(&self) -> Option<&LoadingError> {
    Stage::ALL.iter().find_map(|stage| self.error(*stage))
  }

  pub fn is_settled(&self) -> bool {
    matches!(self.phase, Phase::Settled(_))
  }

  pub fn is_running(&self) -> bool {
    matches!(self.phase, Phase::Running(_))
  }

  pub(crate) fn record_success(&mut self, stage: Stage, data: T) {
    self.stage_progress.insert(stage, true);
    self.stage_errors.insert(stage, None);
    self.pending_retries.remove(&stage);
    self.stage_data.insert(stage, data);
  }

  pub(crate) fn record_failure(&mut self, stage: Stage, error: LoadingError) {
    self.stage_progress.insert(stage, false);
    self.pending_retries.remove(&stage);
    self.stage_errors.insert(stage, Some(error));
  }

  /// Settle the sequence. `stages` are the stages that have a fetcher; any
  /// of them left unloaded keeps the outcome from being `Complete`.
  pub(crate) fn settle(&mut self, stages: &[Stage]) {
    let all_loaded = stages.iter().all(|stage| self.is_complete(*stage));
    let outcome = if !self.is_complete(Stage::Critical) && !self.has_partial_data {
      Outcome::Failed
    } else if self.current_error().is_some() || self.has_partial_data || !all_loaded {
      Outcome::Degraded
    } else {
      Outcome::Complete
    };
    self.phase = Phase::Settled(outcome);
    self.current_stage = None;
  }
}
