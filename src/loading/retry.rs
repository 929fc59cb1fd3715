//! Bounded retry planning.
//!
//! Delays are linear in the attempt number: `base_delay * attempt`, or
//! `base_delay * (attempt - 1)` for kinds whose first retry is immediate.
//! The result is capped at [`MAX_RETRY_DELAY`].

use std::time::Duration;

use super::error::LoadingError;

/// Maximum automatic retries per stage and sequence.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Upper bound on any computed retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Delays above this should be shown to the user as a countdown.
pub const COUNTDOWN_THRESHOLD: Duration = Duration::from_secs(2);

/// Decision for the next automatic retry of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPlan {
  /// 1-based retry number
  pub attempt: u32,
  pub delay: Duration,
  pub show_countdown: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPlanner {
  max_attempts: u32,
  max_delay: Duration,
}

impl Default for RetryPlanner {
  fn default() -> Self {
    Self {
      max_attempts: MAX_RETRY_ATTEMPTS,
      max_delay: MAX_RETRY_DELAY,
    }
  }
}

impl RetryPlanner {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_attempts
  }

  /// Delay before retry number `attempt` (1-based).
  pub fn compute_delay(&self, error: &LoadingError, attempt: u32) -> Duration {
    let config = error.kind.config();
    let steps = if config.immediate_first_retry {
      attempt.saturating_sub(1)
    } else {
      attempt.max(1)
    };
    config.base_delay.saturating_mul(steps).min(self.max_delay)
  }

  pub fn can_retry(&self, error: &LoadingError, attempt: u32) -> bool {
    error.retryable && attempt >= 1 && attempt <= self.max_attempts
  }

  /// Plan retry number `attempt`, or `None` once retries are exhausted or the
  /// error is not retryable.
  pub fn plan(&self, error: &LoadingError, attempt: u32) -> Option<RetryPlan> {
    if !self.can_retry(error, attempt) {
      return None;
    }
    let delay = self.compute_delay(error, attempt);
    Some(RetryPlan {
      attempt,
      delay,
      show_countdown: delay > COUNTDOWN_THRESHOLD,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::loading::error::ErrorKind;
  use crate::loading::stage::Stage;

  fn error(kind: ErrorKind) -> LoadingError {
    LoadingError::new(kind, Stage::Critical)
  }

  #[test]
  fn test_delay_is_non_decreasing() {
    let planner = RetryPlanner::new();
    for kind in [
      ErrorKind::NetworkTimeout,
      ErrorKind::RateLimitExceeded,
      ErrorKind::EnhancementFailed,
    ] {
      let err = error(kind);
      let delays: Vec<_> = (1..=6).map(|a| planner.compute_delay(&err, a)).collect();
      assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{:?}", delays);
    }
  }

  #[test]
  fn test_network_timeout_first_retry_is_immediate() {
    let planner = RetryPlanner::new();
    let err = error(ErrorKind::NetworkTimeout);
    assert_eq!(planner.compute_delay(&err, 1), Duration::ZERO);
    assert_eq!(planner.compute_delay(&err, 2), Duration::from_secs(1));
    assert_eq!(planner.compute_delay(&err, 3), Duration::from_secs(2));
  }

  #[test]
  fn test_rate_limit_always_waits() {
    let planner = RetryPlanner::new();
    let err = error(ErrorKind::RateLimitExceeded);
    for attempt in 0..=MAX_RETRY_ATTEMPTS {
      assert!(planner.compute_delay(&err, attempt) > Duration::ZERO);
    }
    let plan = planner.plan(&err, 1).unwrap();
    assert!(plan.show_countdown);
  }

  #[test]
  fn test_delay_is_capped() {
    let planner = RetryPlanner::new();
    let err = error(ErrorKind::RateLimitExceeded);
    assert_eq!(planner.compute_delay(&err, 100), MAX_RETRY_DELAY);
  }

  #[test]
  fn test_retry_bound() {
    let planner = RetryPlanner::new();
    let err = error(ErrorKind::NetworkTimeout);
    assert!(planner.can_retry(&err, 1));
    assert!(planner.can_retry(&err, MAX_RETRY_ATTEMPTS));
    assert!(!planner.can_retry(&err, MAX_RETRY_ATTEMPTS + 1));
    assert_eq!(planner.plan(&err, MAX_RETRY_ATTEMPTS + 1), None);
  }

  #[test]
  fn test_non_retryable_is_never_planned() {
    let planner = RetryPlanner::new();
    assert_eq!(planner.plan(&error(ErrorKind::PermissionDenied), 1), None);
    assert_eq!(planner.plan(&error(ErrorKind::ValidationError), 1), None);
  }

  #[test]
  fn test_short_delays_have_no_countdown() {
    let planner = RetryPlanner::new();
    let plan = planner.plan(&error(ErrorKind::NetworkTimeout), 2).unwrap();
    assert_eq!(plan.delay, Duration::from_secs(1));
    assert!(!plan.show_countdown);
  }
}
