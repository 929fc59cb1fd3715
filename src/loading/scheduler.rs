//! Low-priority scheduling for background (enhancement) work.

use futures::future::BoxFuture;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Capability to run a task once foreground work allows it.
///
/// `timeout` bounds how long the task may be deferred; after it elapses the
/// task starts regardless.
pub trait BackgroundScheduler: Send + Sync {
  fn schedule_background(&self, task: BoxFuture<'static, ()>, timeout: Duration) -> JoinHandle<()>;
}

/// Counts in-flight foreground fetches.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
  tx: Arc<watch::Sender<usize>>,
}

impl ActivityTracker {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(0);
    Self { tx: Arc::new(tx) }
  }

  /// Mark foreground work as started until the guard is dropped.
  pub fn begin(&self) -> ActivityGuard {
    self.tx.send_modify(|n| *n += 1);
    ActivityGuard {
      tx: Arc::clone(&self.tx),
    }
  }

  pub fn in_flight(&self) -> usize {
    *self.tx.borrow()
  }

  /// Resolves when no foreground work is in flight.
  pub async fn idle(&self) {
    let mut rx = self.tx.subscribe();
    let _ = rx.wait_for(|n| *n == 0).await;
  }
}

impl Default for ActivityTracker {
  fn default() -> Self {
    Self::new()
  }
}

pub struct ActivityGuard {
  tx: Arc<watch::Sender<usize>>,
}

impl Drop for ActivityGuard {
  fn drop(&mut self) {
    self.tx.send_modify(|n| *n = n.saturating_sub(1));
  }
}

/// Defers background work by a fixed delay.
#[derive(Debug, Clone, Copy)]
pub struct TimerScheduler {
  delay: Duration,
}

impl TimerScheduler {
  pub fn new(delay: Duration) -> Self {
    Self { delay }
  }
}

impl BackgroundScheduler for TimerScheduler {
  fn schedule_background(&self, task: BoxFuture<'static, ()>, timeout: Duration) -> JoinHandle<()> {
    let wait = self.delay.min(timeout);
    tokio::spawn(async move {
      tokio::time::sleep(wait).await;
      task.await;
    })
  }
}

/// Defers background work until the foreground goes idle.
#[derive(Debug, Clone, Default)]
pub struct IdleScheduler {
  activity: ActivityTracker,
}

impl IdleScheduler {
  pub fn new(activity: ActivityTracker) -> Self {
    Self { activity }
  }
}

impl BackgroundScheduler for IdleScheduler {
  fn schedule_background(&self, task: BoxFuture<'static, ()>, timeout: Duration) -> JoinHandle<()> {
    let activity = self.activity.clone();
    tokio::spawn(async move {
      // Let already-queued foreground continuations run first.
      tokio::task::yield_now().await;
      tokio::select! {
        _ = activity.idle() => {}
        _ = tokio::time::sleep(timeout) => {
          tracing::debug!(in_flight = activity.in_flight(), "background wait timed out");
        }
      }
      task.await;
    })
  }
}

/// Which background scheduler the host provides.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMode {
  #[default]
  Idle,
  Timer,
}

/// Pick the scheduler for `mode`.
pub fn for_host(
  mode: BackgroundMode,
  delay: Duration,
  activity: ActivityTracker,
) -> Arc<dyn BackgroundScheduler> {
  match mode {
    BackgroundMode::Idle => Arc::new(IdleScheduler::new(activity)),
    BackgroundMode::Timer => Arc::new(TimerScheduler::new(delay)),
  }
}
