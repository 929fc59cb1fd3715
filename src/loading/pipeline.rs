//! Stage pipeline controller.
//!
//! Runs `critical`, then `full`, then hands `enhancement` to the background
//! scheduler. Every state mutation goes through [`PipelineContext::commit`],
//! which rejects writes from a superseded sequence: the check and the write
//! happen under the same lock that [`StagePipeline::start`] takes to swap in
//! a fresh token.

use futures::future::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cancel::CancellationToken;
use super::degradation::can_proceed_after;
use super::error::{ErrorClassifier, FetchError, LoadingError};
use super::fetch::{StageFetchers, StageRequest};
use super::retry::RetryPlanner;
use super::scheduler::{ActivityTracker, BackgroundScheduler, IdleScheduler};
use super::stage::Stage;
use super::state::{PendingRetry, Phase, ProgressiveState};
use crate::clock::{SharedClock, SystemClock};

/// Caller-controlled pipeline behaviour.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
  /// Allow partial results and carrying on past non-retryable `critical`
  /// failures of non-blocking kinds
  pub graceful_degradation: bool,
  /// Upper bound on a single enhancement fetch
  pub enhancement_timeout: Duration,
  /// Longest the enhancement stage waits for the foreground to go idle
  pub background_timeout: Duration,
}

impl Default for PipelineOptions {
  fn default() -> Self {
    Self {
      graceful_degradation: true,
      enhancement_timeout: Duration::from_secs(10),
      background_timeout: Duration::from_secs(2),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TaskSlot {
  Sequence,
  Retry(Stage),
  Background,
}

enum StageOutcome {
  Succeeded,
  Failed(LoadingError),
}

struct Inner<T> {
  state: ProgressiveState<T>,
  token: CancellationToken,
  tasks: HashMap<TaskSlot, JoinHandle<()>>,
}

impl<T> Inner<T> {
  fn abort_tasks(&mut self) {
    for (_, handle) in self.tasks.drain() {
      handle.abort();
    }
  }
}

struct PipelineContext<T> {
  fetchers: StageFetchers<T>,
  classifier: ErrorClassifier,
  planner: RetryPlanner,
  scheduler: Arc<dyn BackgroundScheduler>,
  activity: ActivityTracker,
  clock: SharedClock,
  options: PipelineOptions,
  inner: Mutex<Inner<T>>,
  updates: watch::Sender<ProgressiveState<T>>,
}

pub struct PipelineBuilder<T> {
  fetchers: StageFetchers<T>,
  classifier: ErrorClassifier,
  planner: RetryPlanner,
  scheduler: Option<Arc<dyn BackgroundScheduler>>,
  activity: Option<ActivityTracker>,
  clock: SharedClock,
  options: PipelineOptions,
}

impl<T: Clone + Send + Sync + 'static> PipelineBuilder<T> {
  pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
    self.classifier = classifier;
    self
  }

  pub fn planner(mut self, planner: RetryPlanner) -> Self {
    self.planner = planner;
    self
  }

  pub fn scheduler(mut self, scheduler: Arc<dyn BackgroundScheduler>) -> Self {
    self.scheduler = Some(scheduler);
    self
  }

  /// Tracker that foreground stage fetches register with.
  pub fn activity(mut self, activity: ActivityTracker) -> Self {
    self.activity = Some(activity);
    self
  }

  pub fn clock(mut self, clock: SharedClock) -> Self {
    self.clock = clock;
    self
  }

  pub fn options(mut self, options: PipelineOptions) -> Self {
    self.options = options;
    self
  }

  pub fn build(self) -> StagePipeline<T> {
    let activity = self.activity.unwrap_or_default();
    let scheduler = self
      .scheduler
      .unwrap_or_else(|| Arc::new(IdleScheduler::new(activity.clone())));
    let state = ProgressiveState::new(None, self.options.graceful_degradation);
    let (updates, _rx) = watch::channel(state.clone());

    StagePipeline {
      ctx: Arc::new(PipelineContext {
        fetchers: self.fetchers,
        classifier: self.classifier,
        planner: self.planner,
        scheduler,
        activity,
        clock: self.clock,
        options: self.options,
        inner: Mutex::new(Inner {
          state,
          token: CancellationToken::new(),
          tasks: HashMap::new(),
        }),
        updates,
      }),
    }
  }
}

/// Owns the progress of the current request sequence.
///
/// Must be used from within a tokio runtime. Dropping the pipeline cancels
/// the active sequence and every timer tied to it.
pub struct StagePipeline<T> {
  ctx: Arc<PipelineContext<T>>,
}

impl<T: Clone + Send + Sync + 'static> StagePipeline<T> {
  pub fn builder(fetchers: StageFetchers<T>) -> PipelineBuilder<T> {
    PipelineBuilder {
      fetchers,
      classifier: ErrorClassifier::new(),
      planner: RetryPlanner::new(),
      scheduler: None,
      activity: None,
      clock: Arc::new(SystemClock),
      options: PipelineOptions::default(),
    }
  }

  pub fn new(
    fetchers: StageFetchers<T>,
    classifier: ErrorClassifier,
    planner: RetryPlanner,
    scheduler: Arc<dyn BackgroundScheduler>,
  ) -> Self {
    Self::builder(fetchers)
      .classifier(classifier)
      .planner(planner)
      .scheduler(scheduler)
      .build()
  }

  /// Start a sequence for `owner` unless one for the same owner is already
  /// active. Returns whether a new sequence started.
  pub fn load(&self, owner: impl Into<String>) -> bool {
    let owner = owner.into();
    let mut inner = self.ctx.lock();
    if inner.state.owner.as_deref() == Some(owner.as_str()) && inner.state.phase != Phase::Idle {
      return false;
    }
    self.begin(&mut inner, owner);
    true
  }

  /// Start a fresh sequence for `owner`, cancelling whatever was running.
  pub fn start(&self, owner: impl Into<String>) {
    let mut inner = self.ctx.lock();
    self.begin(&mut inner, owner.into());
  }

  fn begin(&self, inner: &mut Inner<T>, owner: String) {
    let token = CancellationToken::new();
    if inner.token.cancel() {
      debug!(owner = ?inner.state.owner, "superseded previous sequence");
    }
    inner.abort_tasks();
    inner.token = token.clone();

    let mut state = ProgressiveState::new(Some(owner.clone()), self.ctx.options.graceful_degradation);
    state.phase = Phase::Running(Stage::Critical);
    state.current_stage = Some(Stage::Critical);
    inner.state = state;
    self.ctx.updates.send_replace(inner.state.clone());

    info!(owner = %owner, "starting load sequence");
    let ctx = Arc::clone(&self.ctx);
    let handle = tokio::spawn(ctx.run_sequence(owner, token));
    inner.tasks.insert(TaskSlot::Sequence, handle);
  }

  /// Re-run a single stage of a settled sequence.
  ///
  /// Clears the stage's error and retry count, then fetches it again with a
  /// fresh automatic retry budget. Upstream stages are not re-run. Returns
  /// `false` if there is no settled sequence or the stage has no fetcher.
  pub fn retry_stage(&self, stage: Stage) -> bool {
    if self.ctx.fetchers.get(stage).is_none() {
      return false;
    }

    let mut inner = self.ctx.lock();
    let Some(owner) = inner.state.owner.clone() else {
      return false;
    };
    if !inner.state.is_settled() {
      debug!(owner = %owner, stage = %stage, "ignoring retry while sequence is running");
      return false;
    }

    if let Some(previous) = inner.tasks.remove(&TaskSlot::Retry(stage)) {
      previous.abort();
    }
    let state = &mut inner.state;
    state.stage_errors.insert(stage, None);
    state.retry_attempts.insert(stage, 0);
    state.pending_retries.remove(&stage);
    state.phase = Phase::Running(stage);
    state.current_stage = Some(stage);
    self.ctx.updates.send_replace(inner.state.clone());

    info!(owner = %owner, stage = %stage, "manual retry");
    let token = inner.token.clone();
    let ctx = Arc::clone(&self.ctx);
    let handle = tokio::spawn(ctx.run_manual_retry(owner, stage, token));
    inner.tasks.insert(TaskSlot::Retry(stage), handle);
    true
  }

  /// Retry one stage, or restart the whole sequence for the current owner.
  pub fn manual_retry(&self, stage: Option<Stage>) -> bool {
    match stage {
      Some(stage) => self.retry_stage(stage),
      None => {
        let mut inner = self.ctx.lock();
        match inner.state.owner.clone() {
          Some(owner) => {
            self.begin(&mut inner, owner);
            true
          }
          None => false,
        }
      }
    }
  }

  pub fn snapshot(&self) -> ProgressiveState<T> {
    self.ctx.lock().state.clone()
  }

  /// Receive every committed state change.
  pub fn subscribe(&self) -> watch::Receiver<ProgressiveState<T>> {
    self.ctx.updates.subscribe()
  }

  /// Wait until no sequence is running: it settled, or it was disposed.
  pub async fn wait_settled(&self) -> ProgressiveState<T> {
    let mut rx = self.subscribe();
    let settled = match rx.wait_for(|state| !state.is_running()).await {
      Ok(state) => state.clone(),
      Err(_) => self.snapshot(),
    };
    settled
  }

  /// Cancel the active sequence and every pending timer.
  ///
  /// Loaded data is kept; the phase drops back to `Idle` so a later `load`
  /// for the same owner starts afresh.
  pub fn dispose(&self) {
    let mut inner = self.ctx.lock();
    if inner.token.cancel() {
      debug!(owner = ?inner.state.owner, "disposed active sequence");
    }
    inner.abort_tasks();
    let state = &mut inner.state;
    state.pending_retries.clear();
    state.phase = Phase::Idle;
    state.current_stage = None;
    self.ctx.updates.send_replace(inner.state.clone());
  }
}

impl<T> Drop for StagePipeline<T> {
  fn drop(&mut self) {
    let mut inner = self.ctx.inner.lock().unwrap_or_else(PoisonError::into_inner);
    inner.token.cancel();
    inner.abort_tasks();
  }
}

impl<T: Clone + Send + Sync + 'static> PipelineContext<T> {
  fn lock(&self) -> MutexGuard<'_, Inner<T>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Apply `f` to the state if `token` still owns it, then publish.
  fn commit(&self, token: &CancellationToken, f: impl FnOnce(&mut ProgressiveState<T>)) -> bool {
    let mut inner = self.lock();
    if token.is_cancelled() || inner.token.id() != token.id() {
      return false;
    }
    f(&mut inner.state);
    self.updates.send_replace(inner.state.clone());
    true
  }

  fn track(&self, token: &CancellationToken, slot: TaskSlot, handle: JoinHandle<()>) {
    let mut inner = self.lock();
    if token.is_cancelled() || inner.token.id() != token.id() {
      handle.abort();
      return;
    }
    inner.tasks.insert(slot, handle);
  }

  async fn run_sequence(self: Arc<Self>, owner: String, token: CancellationToken) {
    match self.run_stage(&owner, Stage::Critical, &token, true).await {
      None => return,
      Some(StageOutcome::Succeeded) => {}
      Some(StageOutcome::Failed(error)) => {
        if !can_proceed_after(&error, self.options.graceful_degradation) {
          warn!(owner = %owner, kind = %error.kind, "critical stage failed, halting sequence");
          let stages = self.fetchers.stages();
          self.commit(&token, |state| state.settle(&stages));
          return;
        }
        info!(owner = %owner, kind = %error.kind, "critical stage failed, continuing with partial data");
        if !self.commit(&token, |state| state.has_partial_data = true) {
          return;
        }
      }
    }

    self.run_downstream(owner, token).await;
  }

  /// Run `full` then schedule `enhancement`, skipping stages already loaded.
  /// Settles the sequence once the last stage finishes.
  async fn run_downstream(self: Arc<Self>, owner: String, token: CancellationToken) {
    let loaded = |stage: Stage| self.lock().state.is_complete(stage);

    if self.fetchers.get(Stage::Full).is_some() && !loaded(Stage::Full) {
      if !self.commit(&token, |state| enter(state, Stage::Full)) {
        return;
      }
      match self.run_stage(&owner, Stage::Full, &token, true).await {
        None => return,
        Some(StageOutcome::Succeeded) => {}
        Some(StageOutcome::Failed(error)) => {
          info!(owner = %owner, kind = %error.kind, "full stage failed, continuing");
          if !self.commit(&token, |state| state.has_partial_data = true) {
            return;
          }
        }
      }
    }

    if self.fetchers.get(Stage::Enhancement).is_none() || loaded(Stage::Enhancement) {
      let stages = self.fetchers.stages();
      self.commit(&token, |state| state.settle(&stages));
      info!(owner = %owner, "load sequence settled");
      return;
    }

    if !self.commit(&token, |state| enter(state, Stage::Enhancement)) {
      return;
    }
    let ctx = Arc::clone(&self);
    let background_token = token.clone();
    let task = async move {
      let outcome = ctx
        .run_stage(&owner, Stage::Enhancement, &background_token, false)
        .await;
      let failed = match outcome {
        None => return,
        Some(StageOutcome::Succeeded) => false,
        Some(StageOutcome::Failed(_)) => true,
      };
      let stages = ctx.fetchers.stages();
      ctx.commit(&background_token, |state| {
        if failed {
          state.has_partial_data = true;
        }
        state.settle(&stages);
      });
      info!(owner = %owner, "load sequence settled");
    }
    .boxed();
    let handle = self
      .scheduler
      .schedule_background(task, self.options.background_timeout);
    self.track(&token, TaskSlot::Background, handle);
  }

  async fn run_manual_retry(self: Arc<Self>, owner: String, stage: Stage, token: CancellationToken) {
    let Some(outcome) = self.run_stage(&owner, stage, &token, true).await else {
      return;
    };

    // A recovered critical stage unblocks whatever the first run skipped.
    if stage == Stage::Critical && matches!(outcome, StageOutcome::Succeeded) {
      let pending_downstream = {
        let inner = self.lock();
        [Stage::Full, Stage::Enhancement]
          .into_iter()
          .any(|s| self.fetchers.get(s).is_some() && !inner.state.is_complete(s))
      };
      if pending_downstream {
        info!(owner = %owner, "critical recovered, resuming downstream stages");
        let resumed = self.commit(&token, |state| state.has_partial_data = false);
        if resumed {
          self.run_downstream(owner, token).await;
        }
        return;
      }
    }

    let stages = self.fetchers.stages();
    self.commit(&token, |state| {
      match outcome {
        StageOutcome::Succeeded => {
          if state.current_error().is_none() {
            state.has_partial_data = false;
          }
        }
        StageOutcome::Failed(_) if stage != Stage::Critical => state.has_partial_data = true,
        StageOutcome::Failed(_) => {}
      }
      state.settle(&stages);
    });
  }

  /// Fetch `stage` until it succeeds, retries run out, or the sequence is
  /// cancelled (`None`).
  async fn run_stage(
    &self,
    owner: &str,
    stage: Stage,
    token: &CancellationToken,
    auto_retry: bool,
  ) -> Option<StageOutcome> {
    let fetch = Arc::clone(self.fetchers.get(stage)?);
    let mut attempt = 0;

    loop {
      debug!(owner = %owner, stage = %stage, attempt, "fetching stage");
      let request = StageRequest {
        owner: owner.to_string(),
        stage,
        attempt,
        token: token.clone(),
      };

      let result = {
        let _foreground = (stage != Stage::Enhancement).then(|| self.activity.begin());
        let fetched = async {
          if stage == Stage::Enhancement {
            let limit = self.options.enhancement_timeout;
            match tokio::time::timeout(limit, fetch(request)).await {
              Ok(result) => result,
              Err(_) => Err(FetchError::Message(format!(
                "enhancement timeout after {}ms",
                limit.as_millis()
              ))),
            }
          } else {
            fetch(request).await
          }
        };
        tokio::select! {
          biased;
          _ = token.cancelled() => return None,
          result = fetched => result,
        }
      };
      if token.is_cancelled() {
        return None;
      }

      let error = match result.and_then(|response| response.into_data()) {
        Ok(data) => {
          if !self.commit(token, |state| state.record_success(stage, data)) {
            return None;
          }
          info!(owner = %owner, stage = %stage, attempt, "stage loaded");
          return Some(StageOutcome::Succeeded);
        }
        Err(raw) => {
          let mut context = BTreeMap::new();
          context.insert("owner".to_string(), owner.to_string());
          context.insert("attempt".to_string(), attempt.to_string());
          self.classifier.classify(raw, stage, Some(context))
        }
      };

      let next = attempt + 1;
      let plan = if auto_retry {
        self.planner.plan(&error, next)
      } else {
        None
      };

      let Some(plan) = plan else {
        warn!(
          owner = %owner,
          stage = %stage,
          kind = %error.kind,
          attempts = attempt,
          "stage failed"
        );
        let recorded = error.clone();
        if !self.commit(token, |state| state.record_failure(stage, recorded)) {
          return None;
        }
        return Some(StageOutcome::Failed(error));
      };

      let now = self.clock.now();
      warn!(
        owner = %owner,
        stage = %stage,
        kind = %error.kind,
        attempt = next,
        delay_ms = plan.delay.as_millis() as u64,
        "stage failed, retrying"
      );
      let committed = self.commit(token, |state| {
        state.record_failure(stage, error);
        state.retry_attempts.insert(stage, next);
        state.last_retry_time.insert(stage, now);
        state.pending_retries.insert(stage, PendingRetry::new(plan, now));
      });
      if !committed {
        return None;
      }

      tokio::select! {
        biased;
        _ = token.cancelled() => return None,
        _ = tokio::time::sleep(plan.delay) => {}
      }
      if !self.commit(token, |state| {
        state.pending_retries.remove(&stage);
      }) {
        return None;
      }
      attempt = next;
    }
  }
}

fn enter<T>(state: &mut ProgressiveState<T>, stage: Stage) {
  state.phase = Phase::Running(stage);
  state.current_stage = Some(stage);
}
