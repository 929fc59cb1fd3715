use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::loading::{for_host, ActivityTracker, BackgroundMode, BackgroundScheduler, PipelineOptions};
use crate::scenario::ScenarioConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub debounce: DebounceConfig,
  pub pipeline: PipelineConfig,
  pub background: BackgroundConfig,
  pub logging: LoggingConfig,
  pub search: SearchConfig,
  /// Scripted stage outcomes for the CLI
  pub scenario: ScenarioConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub max_size: usize,
  pub ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_size: crate::cache::DEFAULT_MAX_SIZE,
      ttl_secs: crate::cache::DEFAULT_TTL.as_secs(),
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
  pub window_ms: u64,
}

impl Default for DebounceConfig {
  fn default() -> Self {
    Self {
      window_ms: crate::debounce::DEFAULT_WINDOW.as_millis() as u64,
    }
  }
}

impl DebounceConfig {
  pub fn window(&self) -> Duration {
    Duration::from_millis(self.window_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// Allow partial results after non-fatal stage failures
  pub graceful_degradation: bool,
  pub enhancement_timeout_ms: u64,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    let defaults = PipelineOptions::default();
    Self {
      graceful_degradation: defaults.graceful_degradation,
      enhancement_timeout_ms: defaults.enhancement_timeout.as_millis() as u64,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
  /// `idle` waits for foreground fetches to finish; `timer` waits a fixed delay
  pub mode: BackgroundMode,
  /// Longest background work is deferred
  pub timeout_ms: u64,
  /// Delay used by the `timer` mode
  pub delay_ms: u64,
}

impl Default for BackgroundConfig {
  fn default() -> Self {
    Self {
      mode: BackgroundMode::default(),
      timeout_ms: PipelineOptions::default().background_timeout.as_millis() as u64,
      delay_ms: 50,
    }
  }
}

impl BackgroundConfig {
  pub fn scheduler(&self, activity: ActivityTracker) -> Arc<dyn BackgroundScheduler> {
    for_host(self.mode, Duration::from_millis(self.delay_ms), activity)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when `PLOADER_LOG` is unset
  pub level: String,
  /// Write logs to a daily rolling file here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
  /// Queries shorter than this (after normalization) are not sent
  pub min_query_len: usize,
}

impl Default for SearchConfig {
  fn default() -> Self {
    Self { min_query_len: 2 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./ploader.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ploader/config.yaml
  ///
  /// Defaults apply when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("ploader.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ploader").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to load config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = if contents.trim().is_empty() {
      Config::default()
    } else {
      serde_yaml::from_str(contents).map_err(|e| eyre!("Invalid YAML: {}", e))?
    };
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.cache.max_size == 0 {
      return Err(eyre!("cache.max_size must be at least 1"));
    }
    if self.cache.ttl_secs == 0 {
      return Err(eyre!("cache.ttl_secs must be at least 1"));
    }
    Ok(())
  }

  pub fn pipeline_options(&self) -> PipelineOptions {
    PipelineOptions {
      graceful_degradation: self.pipeline.graceful_degradation,
      enhancement_timeout: Duration::from_millis(self.pipeline.enhancement_timeout_ms),
      background_timeout: Duration::from_millis(self.background.timeout_ms),
    }
  }
}
