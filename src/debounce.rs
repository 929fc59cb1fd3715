//! Key-scoped debouncing.
//!
//! The first call for an idle key runs immediately. Further calls for the
//! same key inside the window replace each other, and only the last one runs
//! once the window passes without another call. Keys never affect each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_WINDOW: Duration = Duration::from_millis(300);

struct DebounceEntry {
  generation: u64,
  timer: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
  entries: Mutex<HashMap<String, DebounceEntry>>,
  generation: AtomicU64,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, HashMap<String, DebounceEntry>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Release `key` if `generation` still owns it.
  fn finish(&self, key: &str, generation: u64) -> bool {
    let mut entries = self.lock();
    match entries.get(key) {
      Some(entry) if entry.generation == generation => {
        entries.remove(key);
        true
      }
      _ => false,
    }
  }
}

/// Must be used from within a tokio runtime.
pub struct Debouncer {
  shared: Arc<Shared>,
  window: Duration,
}

impl Debouncer {
  pub fn new(window: Duration) -> Self {
    Self {
      shared: Arc::new(Shared::default()),
      window,
    }
  }

  pub fn window(&self) -> Duration {
    self.window
  }

  /// Schedule `f` under `key`.
  ///
  /// Returns the future of `f` when it was invoked immediately, or `None`
  /// when it was deferred to the trailing edge of the window. Trailing
  /// results are discarded.
  pub fn schedule<F, Fut>(&self, key: impl Into<String>, f: F) -> Option<Fut>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
  {
    let key = key.into();
    let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed);
    let shared = Arc::clone(&self.shared);
    let window = self.window;

    let mut entries = self.shared.lock();
    match entries.remove(&key) {
      Some(previous) => {
        previous.timer.abort();
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
          tokio::time::sleep(window).await;
          if shared.finish(&timer_key, generation) {
            debug!(key = %timer_key, "running debounced call");
            f().await;
          }
        });
        entries.insert(key, DebounceEntry { generation, timer });
        None
      }
      None => {
        // Holds the key for one window so rapid repeats are deferred.
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
          tokio::time::sleep(window).await;
          shared.finish(&timer_key, generation);
        });
        entries.insert(key, DebounceEntry { generation, timer });
        drop(entries);
        Some(f())
      }
    }
  }

  pub fn is_pending(&self, key: &str) -> bool {
    self.shared.lock().contains_key(key)
  }

  pub fn pending_count(&self) -> usize {
    self.shared.lock().len()
  }

  /// Cancel every pending timer without running its callback.
  pub fn cleanup(&self) {
    let mut entries = self.shared.lock();
    for (_, entry) in entries.drain() {
      entry.timer.abort();
    }
  }
}

impl Default for Debouncer {
  fn default() -> Self {
    Self::new(DEFAULT_WINDOW)
  }
}

impl Drop for Debouncer {
  fn drop(&mut self) {
    self.cleanup();
  }
}
