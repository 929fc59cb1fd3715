use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use progressive_loader::cache::BoundedCache;
use progressive_loader::config::Config;
use progressive_loader::loading::{
  can_show_partial_data, ActivityTracker, ProgressiveState, Stage, StagePipeline,
};
use progressive_loader::{logging, scenario};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ploader")]
#[command(about = "Run a scripted progressive load and print the resulting state")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ploader/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Owner to load; repeat to switch owners mid-load
  #[arg(short, long = "owner", default_value = "demo")]
  owners: Vec<String>,

  /// Manually retry a stage once the load settles
  #[arg(short, long)]
  retry: Option<Stage>,

  /// Pause between owner switches
  #[arg(long, default_value_t = 50)]
  switch_delay_ms: u64,
}

fn report(state: &ProgressiveState<String>, cache: &BoundedCache<String>) -> serde_json::Value {
  json!({
    "state": state,
    "canShowPartialData": can_show_partial_data(state, false),
    "primaryRecovery": state.current_error().and_then(|e| e.primary_recovery()),
    "cache": cache.stats(),
  })
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.logging)?;

  let cache = Arc::new(BoundedCache::new(config.cache.max_size, config.cache.ttl()));
  let fetchers = scenario::build_fetchers(&config.scenario, Some(Arc::clone(&cache)));

  let activity = ActivityTracker::new();
  let pipeline = StagePipeline::builder(fetchers)
    .scheduler(config.background.scheduler(activity.clone()))
    .activity(activity)
    .options(config.pipeline_options())
    .build();

  let switch_delay = Duration::from_millis(args.switch_delay_ms);
  let last = args.owners.len().saturating_sub(1);
  for (i, owner) in args.owners.iter().enumerate() {
    info!(owner = %owner, "loading");
    pipeline.load(owner.as_str());
    if i < last {
      tokio::time::sleep(switch_delay).await;
    }
  }
  let mut state = pipeline.wait_settled().await;

  if let Some(stage) = args.retry {
    if !pipeline.retry_stage(stage) {
      return Err(eyre!("Stage {} cannot be retried", stage));
    }
    state = pipeline.wait_settled().await;
  }

  println!("{}", serde_json::to_string_pretty(&report(&state, &cache))?);
  pipeline.dispose();

  Ok(())
}
