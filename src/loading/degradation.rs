//! Decisions about carrying on after a stage failure.

use super::error::LoadingError;
use super::stage::Stage;
use super::state::ProgressiveState;

/// Whether the sequence may move on to the next stage after `error`.
///
/// Only a `critical` failure of a pipeline-blocking kind stops progression;
/// `full` and `enhancement` failures are always recoverable.
pub fn can_recover_in_next_stage(error: &LoadingError) -> bool {
  error.stage != Stage::Critical || !error.blocks_pipeline()
}

/// Whether the controller advances past a stage that finally failed.
///
/// A `critical` error that is not retryable is terminal unless the caller
/// opted into graceful degradation.
pub fn can_proceed_after(error: &LoadingError, graceful_degradation: bool) -> bool {
  if !can_recover_in_next_stage(error) {
    return false;
  }
  error.stage != Stage::Critical || error.retryable || graceful_degradation
}

/// Whether partial or stale data may be shown while an error is pending.
pub fn can_show_partial_data<T>(state: &ProgressiveState<T>, fallback_provided: bool) -> bool {
  if !state.graceful_degradation {
    return false;
  }
  match state.current_error() {
    None => true,
    Some(error) => {
      error.stage != Stage::Critical || can_recover_in_next_stage(error) || fallback_provided
    }
  }
}
