//! Scripted stage fetchers for the CLI and for exercising the pipeline
//! without a network.
//!
//! Each stage is driven by a list of steps, one per call. The last step
//! repeats once the list is exhausted.
//!
//! - `ok`: succeed with a generated payload
//! - `missing` or `missing: <message>`: respond without data
//! - anything else: fail with that text as the error message, which the
//!   classifier then inspects (e.g. `timeout`, `403 forbidden`, `429`)

use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{cached_stage_fetcher, BoundedCache};
use crate::loading::{
  fetcher, FetchError, FetcherFn, Stage, StageFetchers, StageRequest, StageResponse,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
  Ok,
  Missing(Option<String>),
  Fail(String),
}

impl Step {
  pub fn parse(raw: &str) -> Self {
    let trimmed = raw.trim();
    let lower = trimmed.to_lowercase();
    if lower == "ok" {
      Step::Ok
    } else if lower == "missing" {
      Step::Missing(None)
    } else if lower.starts_with("missing:") {
      Step::Missing(Some(trimmed["missing:".len()..].trim().to_string()))
    } else {
      Step::Fail(trimmed.to_string())
    }
  }
}

fn ok_script() -> Vec<String> {
  vec!["ok".to_string()]
}

fn default_latency() -> u64 {
  100
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ScenarioConfig {
  /// Simulated network latency per call
  #[serde(default = "default_latency")]
  pub latency_ms: u64,
  #[serde(default = "ok_script")]
  pub critical: Vec<String>,
  /// An empty list disables the stage
  #[serde(default = "ok_script")]
  pub full: Vec<String>,
  #[serde(default = "ok_script")]
  pub enhancement: Vec<String>,
}

impl Default for ScenarioConfig {
  fn default() -> Self {
    Self {
      latency_ms: default_latency(),
      critical: ok_script(),
      full: ok_script(),
      enhancement: ok_script(),
    }
  }
}

/// Replays a fixed list of steps, one per call.
#[derive(Debug)]
pub struct ScriptedFetcher {
  stage: Stage,
  steps: Vec<Step>,
  latency: Duration,
  calls: AtomicUsize,
}

impl ScriptedFetcher {
  pub fn new(stage: Stage, script: &[String], latency: Duration) -> Self {
    let mut steps: Vec<Step> = script.iter().map(|s| Step::parse(s)).collect();
    if steps.is_empty() {
      steps.push(Step::Ok);
    }
    Self {
      stage,
      steps,
      latency,
      calls: AtomicUsize::new(0),
    }
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn next_step(&self) -> Step {
    let n = self.calls.fetch_add(1, Ordering::SeqCst);
    let index = n.min(self.steps.len() - 1);
    self.steps[index].clone()
  }

  pub fn into_fetcher(self: Arc<Self>) -> FetcherFn<String> {
    fetcher(move |request: StageRequest| {
      let this = Arc::clone(&self);
      async move {
        let step = this.next_step();
        tokio::select! {
          _ = request.token.cancelled() => {
            return Err(FetchError::message("cancelled"));
          }
          _ = tokio::time::sleep(this.latency) => {}
        }
        match step {
          Step::Ok => Ok(StageResponse::data(format!(
            "{} data for {}",
            this.stage, request.owner
          ))),
          Step::Missing(Some(message)) => Ok(StageResponse::missing(message)),
          Step::Missing(None) => Ok(StageResponse {
            data: None,
            message: None,
          }),
          Step::Fail(message) => Err(FetchError::message(message)),
        }
      }
    })
  }
}

/// Build the stage fetchers a scenario describes, optionally behind a cache.
pub fn build_fetchers(
  scenario: &ScenarioConfig,
  cache: Option<Arc<BoundedCache<String>>>,
) -> StageFetchers<String> {
  let latency = Duration::from_millis(scenario.latency_ms);
  let make = |stage: Stage, script: &[String]| {
    let fetch = Arc::new(ScriptedFetcher::new(stage, script, latency)).into_fetcher();
    match &cache {
      Some(cache) => cached_stage_fetcher(Arc::clone(cache), fetch),
      None => fetch,
    }
  };

  let mut fetchers = StageFetchers::new(make(Stage::Critical, &scenario.critical));
  if !scenario.full.is_empty() {
    fetchers = fetchers.with_full(make(Stage::Full, &scenario.full));
  }
  if !scenario.enhancement.is_empty() {
    fetchers = fetchers.with_enhancement(make(Stage::Enhancement, &scenario.enhancement));
  }
  fetchers
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::loading::{CancellationToken, ErrorKind, Phase, StagePipeline, TimerScheduler};

  fn request(stage: Stage) -> StageRequest {
    StageRequest {
      owner: "acme".into(),
      stage,
      attempt: 0,
      token: CancellationToken::new(),
    }
  }

  fn script(steps: &[&str]) -> Vec<String> {
    steps.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn test_parse_steps() {
    assert_eq!(Step::parse(" OK "), Step::Ok);
    assert_eq!(Step::parse("missing"), Step::Missing(None));
    assert_eq!(
      Step::parse("Missing: Not Found"),
      Step::Missing(Some("Not Found".into()))
    );
    assert_eq!(Step::parse("403 forbidden"), Step::Fail("403 forbidden".into()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_steps_replay_and_last_repeats() {
    let scripted = Arc::new(ScriptedFetcher::new(
      Stage::Critical,
      &script(&["timeout", "ok"]),
      Duration::from_millis(10),
    ));
    let fetch = Arc::clone(&scripted).into_fetcher();

    assert!(fetch(request(Stage::Critical)).await.is_err());
    for _ in 0..2 {
      let response = fetch(request(Stage::Critical)).await.unwrap();
      assert_eq!(response.data.as_deref(), Some("critical data for acme"));
    }
    assert_eq!(scripted.calls(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_request_stops_early() {
    let fetch = Arc::new(ScriptedFetcher::new(
      Stage::Full,
      &script(&["ok"]),
      Duration::from_secs(60),
    ))
    .into_fetcher();
    let req = request(Stage::Full);
    req.token.cancel();
    assert!(fetch(req).await.is_err());
  }

  #[test]
  fn test_empty_script_disables_stage() {
    let scenario = ScenarioConfig {
      full: Vec::new(),
      ..ScenarioConfig::default()
    };
    let fetchers = build_fetchers(&scenario, None);
    assert!(fetchers.get(Stage::Full).is_none());
    assert!(fetchers.get(Stage::Enhancement).is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_scenario_drives_pipeline() {
    let scenario = ScenarioConfig {
      latency_ms: 20,
      critical: script(&["timeout", "ok"]),
      full: script(&["429 rate limit", "ok"]),
      enhancement: script(&["boom"]),
    };
    let pipeline = StagePipeline::builder(build_fetchers(&scenario, None))
      .scheduler(Arc::new(TimerScheduler::new(Duration::ZERO)))
      .build();
    pipeline.start("acme");
    let state = pipeline.wait_settled().await;

    assert!(matches!(state.phase, Phase::Settled(_)));
    assert_eq!(state.attempts(Stage::Critical), 1);
    assert_eq!(state.attempts(Stage::Full), 1);
    assert!(state.is_complete(Stage::Full));
    assert_eq!(
      state.error(Stage::Enhancement).map(|e| e.kind),
      Some(ErrorKind::EnhancementFailed)
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_cached_scenario_skips_network_on_reload() {
    let cache = Arc::new(BoundedCache::new(8, Duration::from_secs(60)));
    let scenario = ScenarioConfig {
      latency_ms: 20,
      critical: script(&["ok", "timeout"]),
      full: Vec::new(),
      enhancement: Vec::new(),
    };
    let pipeline = StagePipeline::builder(build_fetchers(&scenario, Some(cache.clone()))).build();

    pipeline.start("acme");
    pipeline.wait_settled().await;
    assert_eq!(cache.len(), 1);

    // The second scripted step would fail; the cache answers instead.
    pipeline.start("acme");
    let state = pipeline.wait_settled().await;
    assert!(state.is_complete(Stage::Critical));
    assert_eq!(state.attempts(Stage::Critical), 0);
  }
}
