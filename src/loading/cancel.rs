use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Revocable signal shared by every fetch of one request sequence.
///
/// Clones observe the same signal. Cancellation is one-way.
#[derive(Debug, Clone)]
pub struct CancellationToken {
  id: u64,
  tx: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(false);
    Self {
      id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
      tx: Arc::new(tx),
    }
  }

  /// Identifies the sequence this token belongs to.
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Returns `true` if this call performed the cancellation.
  pub fn cancel(&self) -> bool {
    !self.tx.send_replace(true)
  }

  pub fn is_cancelled(&self) -> bool {
    *self.tx.borrow()
  }

  /// Resolves once the token is cancelled.
  pub async fn cancelled(&self) {
    let mut rx = self.tx.subscribe();
    // The sender lives as long as `self`, so this only returns on cancel.
    let _ = rx.wait_for(|cancelled| *cancelled).await;
  }
}

impl Default for CancellationToken {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn test_cancel_is_one_way() {
    let token = CancellationToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());
    assert!(token.cancel());
    assert!(!token.cancel());
    assert!(clone.is_cancelled());
  }

  #[test]
  fn test_tokens_have_distinct_ids() {
    assert_ne!(CancellationToken::new().id(), CancellationToken::new().id());
  }

  #[tokio::test]
  async fn test_cancelled_wakes_waiter() {
    let token = CancellationToken::new();
    let waiter = {
      let token = token.clone();
      tokio::spawn(async move { token.cancelled().await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .expect("waiter woke")
      .expect("task joined");
  }

  #[tokio::test]
  async fn test_cancelled_returns_immediately_when_already_cancelled() {
    let token = CancellationToken::new();
    token.cancel();
    token.cancelled().await;
  }
}
