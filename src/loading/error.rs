//! Failure taxonomy and the classifier that maps raw fetch failures onto it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::stage::Stage;

/// Fixed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
  NetworkTimeout,
  PermissionDenied,
  RateLimitExceeded,
  ValidationError,
  EnhancementFailed,
}

/// Static behaviour attached to each [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindConfig {
  pub retryable: bool,
  /// Unit of backoff for this kind
  pub base_delay: Duration,
  /// The first retry fires without waiting
  pub immediate_first_retry: bool,
  /// A failure of this kind at `critical` halts the sequence
  pub blocks_critical: bool,
  /// User-facing message; `{stage}` is replaced with the stage name
  pub message_template: &'static str,
}

impl ErrorKind {
  pub fn config(&self) -> KindConfig {
    match self {
      ErrorKind::NetworkTimeout => KindConfig {
        retryable: true,
        base_delay: Duration::from_millis(1_000),
        immediate_first_retry: true,
        blocks_critical: false,
        message_template: "The request timed out while loading {stage} data.",
      },
      ErrorKind::PermissionDenied => KindConfig {
        retryable: false,
        base_delay: Duration::ZERO,
        immediate_first_retry: false,
        blocks_critical: true,
        message_template: "You do not have permission to view this resource.",
      },
      ErrorKind::RateLimitExceeded => KindConfig {
        retryable: true,
        base_delay: Duration::from_millis(5_000),
        immediate_first_retry: false,
        blocks_critical: false,
        message_template: "Too many requests. Waiting before loading {stage} data again.",
      },
      ErrorKind::ValidationError => KindConfig {
        retryable: false,
        base_delay: Duration::ZERO,
        immediate_first_retry: false,
        blocks_critical: true,
        message_template: "The request for {stage} data was rejected as invalid.",
      },
      ErrorKind::EnhancementFailed => KindConfig {
        retryable: true,
        base_delay: Duration::from_millis(2_000),
        immediate_first_retry: true,
        blocks_critical: false,
        message_template: "Some additional details could not be loaded.",
      },
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::NetworkTimeout => "NETWORK_TIMEOUT",
      ErrorKind::PermissionDenied => "PERMISSION_DENIED",
      ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
      ErrorKind::ValidationError => "VALIDATION_ERROR",
      ErrorKind::EnhancementFailed => "ENHANCEMENT_FAILED",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What a recovery option does when chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
  Retry,
  UsePartialData,
  ClearCache,
  RefreshAuth,
  WaitForRateLimit,
}

/// Ordering is `High < Medium < Low` so an ascending sort puts `High` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPriority {
  High,
  Medium,
  Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOption {
  pub id: String,
  pub label: String,
  pub description: String,
  pub action: RecoveryAction,
  pub priority: RecoveryPriority,
}

impl RecoveryOption {
  fn new(
    action: RecoveryAction,
    priority: RecoveryPriority,
    label: &str,
    description: &str,
  ) -> Self {
    let id = match action {
      RecoveryAction::Retry => "retry",
      RecoveryAction::UsePartialData => "use-partial-data",
      RecoveryAction::ClearCache => "clear-cache-retry",
      RecoveryAction::RefreshAuth => "refresh-auth",
      RecoveryAction::WaitForRateLimit => "wait-rate-limit",
    };
    Self {
      id: id.to_string(),
      label: label.to_string(),
      description: description.to_string(),
      action,
      priority,
    }
  }
}

/// A classified stage failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} in {stage} stage: {user_message}")]
#[serde(rename_all = "camelCase")]
pub struct LoadingError {
  pub kind: ErrorKind,
  pub stage: Stage,
  pub retryable: bool,
  pub user_message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub technical_details: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub context: BTreeMap<String, String>,
  #[serde(default)]
  recovery_options: Vec<RecoveryOption>,
}

impl LoadingError {
  /// Build an error with the kind's defaults for retryability, message and
  /// recovery options.
  pub fn new(kind: ErrorKind, stage: Stage) -> Self {
    let config = kind.config();
    let mut error = Self {
      kind,
      stage,
      retryable: config.retryable,
      user_message: config.message_template.replace("{stage}", stage.as_str()),
      technical_details: None,
      context: BTreeMap::new(),
      recovery_options: Vec::new(),
    };
    error.recovery_options = sorted(default_recovery_options(&error));
    error
  }

  pub fn with_details(mut self, details: impl Into<String>) -> Self {
    self.technical_details = Some(details.into());
    self
  }

  pub fn with_context(mut self, context: BTreeMap<String, String>) -> Self {
    self.context.extend(context);
    self
  }

  /// Override retryability, keeping the recovery options consistent with it.
  pub fn with_retryable(mut self, retryable: bool) -> Self {
    self.retryable = retryable;
    self.recovery_options = sorted(default_recovery_options(&self));
    self
  }

  pub fn with_recovery_options(mut self, options: Vec<RecoveryOption>) -> Self {
    self.recovery_options = sorted(options);
    self
  }

  /// Recovery options, highest priority first.
  pub fn recovery_options(&self) -> &[RecoveryOption] {
    &self.recovery_options
  }

  pub fn primary_recovery(&self) -> Option<&RecoveryOption> {
    self.recovery_options.first()
  }

  /// Whether failure of this kind halts the sequence when raised at `critical`.
  pub fn blocks_pipeline(&self) -> bool {
    self.kind.config().blocks_critical
  }
}

fn sorted(mut options: Vec<RecoveryOption>) -> Vec<RecoveryOption> {
  // Stable, so options of equal priority keep their insertion order.
  options.sort_by_key(|o| o.priority);
  options
}

fn default_recovery_options(error: &LoadingError) -> Vec<RecoveryOption> {
  use RecoveryAction::*;
  use RecoveryPriority::*;

  let mut options = Vec::new();
  let partial = RecoveryOption::new(
    UsePartialData,
    Medium,
    "Continue with partial data",
    "Show what has loaded so far.",
  );

  match error.kind {
    ErrorKind::PermissionDenied => {
      options.push(RecoveryOption::new(
        RefreshAuth,
        High,
        "Sign in again",
        "Refresh your credentials and reload.",
      ));
      options.push(RecoveryOption::new(
        ClearCache,
        Low,
        "Clear cache and retry",
        "Discard cached results and load again.",
      ));
    }
    ErrorKind::ValidationError => {
      options.push(RecoveryOption::new(
        ClearCache,
        Medium,
        "Clear cache and retry",
        "Discard cached results and load again.",
      ));
    }
    ErrorKind::RateLimitExceeded => {
      options.push(RecoveryOption::new(
        WaitForRateLimit,
        High,
        "Retry after cooldown",
        "Wait for the rate limit to reset, then load again.",
      ));
    }
    ErrorKind::NetworkTimeout => {
      options.push(RecoveryOption::new(
        ClearCache,
        Low,
        "Clear cache and retry",
        "Discard cached results and load again.",
      ));
    }
    ErrorKind::EnhancementFailed => {
      options.push(RecoveryOption {
        priority: High,
        ..partial.clone()
      });
    }
  }

  if error.retryable && error.kind != ErrorKind::RateLimitExceeded {
    let priority = if error.kind == ErrorKind::EnhancementFailed {
      Medium
    } else {
      High
    };
    options.push(RecoveryOption::new(
      Retry,
      priority,
      "Try again",
      "Load this data again.",
    ));
  }

  if error.stage != Stage::Critical && error.kind != ErrorKind::EnhancementFailed {
    options.push(partial);
  }

  options
}

/// Raw failure shapes returned by stage fetchers, before classification.
#[derive(Debug, Error)]
pub enum FetchError {
  /// Already carries taxonomy fields; passed through unchanged.
  #[error(transparent)]
  Classified(#[from] LoadingError),
  /// HTTP-like failure.
  #[error("{status} {message}")]
  Http { status: u16, message: String },
  #[error("{0}")]
  Message(String),
  #[error("{0}")]
  Report(color_eyre::Report),
}

impl From<color_eyre::Report> for FetchError {
  fn from(report: color_eyre::Report) -> Self {
    FetchError::Report(report)
  }
}

impl FetchError {
  pub fn message(message: impl Into<String>) -> Self {
    FetchError::Message(message.into())
  }
}

/// Maps raw failures onto [`LoadingError`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
  pub fn new() -> Self {
    Self
  }

  /// Classify `raw` as a failure of `stage`.
  ///
  /// Markers are checked in priority order: permission, timeout, rate limit,
  /// validation. Anything unrecognised is a retryable network timeout, or an
  /// enhancement failure when raised by the enhancement stage.
  pub fn classify(
    &self,
    raw: FetchError,
    stage: Stage,
    context: Option<BTreeMap<String, String>>,
  ) -> LoadingError {
    let text = match raw {
      FetchError::Classified(error) => return error,
      other => format!("{:#}", DisplayChain(&other)),
    };

    let kind = kind_from_text(&text, stage);
    let mut error = LoadingError::new(kind, stage);
    if !text.is_empty() {
      error = error.with_details(text);
    }
    match context {
      Some(context) => error.with_context(context),
      None => error,
    }
  }
}

fn kind_from_text(text: &str, stage: Stage) -> ErrorKind {
  let lower = text.to_lowercase();
  let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

  if has(&["401", "403", "permission"]) {
    ErrorKind::PermissionDenied
  } else if has(&["timeout"]) {
    ErrorKind::NetworkTimeout
  } else if has(&["rate limit", "429"]) {
    ErrorKind::RateLimitExceeded
  } else if has(&["validation", "invalid"]) {
    ErrorKind::ValidationError
  } else if stage == Stage::Enhancement {
    ErrorKind::EnhancementFailed
  } else {
    ErrorKind::NetworkTimeout
  }
}

/// Renders an eyre report with its full cause chain so markers in inner
/// errors are visible to the classifier.
struct DisplayChain<'a>(&'a FetchError);

impl fmt::Display for DisplayChain<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.0 {
      FetchError::Report(report) => write!(f, "{:#}", report),
      other => write!(f, "{}", other),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  fn classify(raw: FetchError, stage: Stage) -> LoadingError {
    ErrorClassifier::new().classify(raw, stage, None)
  }

  #[test]
  fn test_permission_markers() {
    for message in ["HTTP 401", "got 403 from server", "Permission denied"] {
      let error = classify(FetchError::message(message), Stage::Critical);
      assert_eq!(error.kind, ErrorKind::PermissionDenied, "{}", message);
      assert!(!error.retryable);
    }
  }

  #[test]
  fn test_permission_wins_over_timeout() {
    let error = classify(
      FetchError::message("403 after timeout"),
      Stage::Critical,
    );
    assert_eq!(error.kind, ErrorKind::PermissionDenied);
  }

  #[test]
  fn test_timeout_wins_over_rate_limit() {
    let error = classify(
      FetchError::message("timeout while waiting on rate limit"),
      Stage::Full,
    );
    assert_eq!(error.kind, ErrorKind::NetworkTimeout);
  }

  #[test]
  fn test_rate_limit_and_validation_markers() {
    let error = classify(
      FetchError::Http {
        status: 429,
        message: "Too Many Requests".into(),
      },
      Stage::Full,
    );
    assert_eq!(error.kind, ErrorKind::RateLimitExceeded);
    assert!(error.retryable);

    let error = classify(FetchError::message("invalid owner key"), Stage::Critical);
    assert_eq!(error.kind, ErrorKind::ValidationError);
  }

  #[test]
  fn test_unknown_message_defaults_to_network_timeout() {
    let error = classify(FetchError::message(""), Stage::Critical);
    assert_eq!(error.kind, ErrorKind::NetworkTimeout);
    assert!(error.retryable);
    assert_eq!(error.technical_details, None);

    let error = classify(FetchError::message("connection reset"), Stage::Full);
    assert_eq!(error.kind, ErrorKind::NetworkTimeout);
  }

  #[test]
  fn test_unknown_enhancement_failure() {
    let error = classify(FetchError::message("boom"), Stage::Enhancement);
    assert_eq!(error.kind, ErrorKind::EnhancementFailed);

    let error = classify(FetchError::message("timeout"), Stage::Enhancement);
    assert_eq!(error.kind, ErrorKind::NetworkTimeout);

    // Only the literal "timeout" marker counts.
    let error = classify(FetchError::message("connection timed out"), Stage::Enhancement);
    assert_eq!(error.kind, ErrorKind::EnhancementFailed);
  }

  #[test]
  fn test_classified_errors_pass_through() {
    let original = LoadingError::new(ErrorKind::ValidationError, Stage::Full)
      .with_details("schema mismatch");
    let error = classify(FetchError::from(original.clone()), Stage::Critical);
    assert_eq!(error, original);
  }

  #[test]
  fn test_report_chain_is_inspected() {
    let report = eyre!("rate limit hit").wrap_err("failed to load repository");
    let error = classify(FetchError::from(report), Stage::Critical);
    assert_eq!(error.kind, ErrorKind::RateLimitExceeded);
  }

  #[test]
  fn test_context_and_message() {
    let mut context = BTreeMap::new();
    context.insert("owner".to_string(), "acme/widgets".to_string());
    let error = ErrorClassifier::new().classify(
      FetchError::message("timeout"),
      Stage::Full,
      Some(context),
    );
    assert_eq!(error.context["owner"], "acme/widgets");
    assert_eq!(
      error.user_message,
      "The request timed out while loading full data."
    );
  }

  #[test]
  fn test_recovery_options_sorted_by_priority() {
    for kind in [
      ErrorKind::NetworkTimeout,
      ErrorKind::PermissionDenied,
      ErrorKind::RateLimitExceeded,
      ErrorKind::ValidationError,
      ErrorKind::EnhancementFailed,
    ] {
      for stage in Stage::ALL {
        let error = LoadingError::new(kind, stage);
        let priorities: Vec<_> = error.recovery_options().iter().map(|o| o.priority).collect();
        let mut expected = priorities.clone();
        expected.sort();
        assert_eq!(priorities, expected, "{} at {}", kind, stage);
        assert!(!error.recovery_options().is_empty());
      }
    }
  }

  #[test]
  fn test_primary_recovery() {
    let error = LoadingError::new(ErrorKind::PermissionDenied, Stage::Critical);
    assert_eq!(
      error.primary_recovery().map(|o| o.action),
      Some(RecoveryAction::RefreshAuth)
    );

    let error = LoadingError::new(ErrorKind::NetworkTimeout, Stage::Critical);
    assert_eq!(
      error.primary_recovery().map(|o| o.action),
      Some(RecoveryAction::Retry)
    );

    let custom = error.with_recovery_options(vec![
      RecoveryOption::new(RecoveryAction::ClearCache, RecoveryPriority::Low, "a", "b"),
      RecoveryOption::new(RecoveryAction::Retry, RecoveryPriority::High, "c", "d"),
    ]);
    assert_eq!(
      custom.primary_recovery().map(|o| o.action),
      Some(RecoveryAction::Retry)
    );
  }
}
