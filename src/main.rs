use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use feedpost::config::Config;
use feedpost::content::{ImageCompressor, PageEnricher};
use feedpost::feed::HttpFeedFetcher;
use feedpost::pipeline::{Components, Pipeline, SystemClock, ThreadJitter};
use feedpost::publish::{BlueskyClient, Publisher};
use feedpost::storage::DedupStore;

const USER_AGENT: &str = concat!("feedpost/", env!("CARGO_PKG_VERSION"));

/// Get the config directory path (~/.config/feedpost/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedpost"))
}

#[derive(Parser, Debug)]
#[command(
    name = "feedpost",
    about = "Publish new feed entries to Bluesky with link-preview cards"
)]
struct Args {
    /// Config file (defaults to ~/.config/feedpost/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Dedup store file; overrides config and environment
    #[arg(long, value_name = "FILE")]
    state: Option<PathBuf>,

    /// Ignore the fetch-interval gate for this run
    #[arg(long)]
    force: bool,

    /// Keep running, triggering a run every --interval-minutes
    #[arg(long)]
    daemon: bool,

    /// Minutes between runs in daemon mode
    #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
    interval_minutes: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));

    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config.apply_env();
    if let Some(state) = &args.state {
        config.state_path = Some(state.clone());
    }
    config.validate().context("Invalid configuration")?;
    tracing::debug!(config = ?config, "Effective configuration");

    let state_path = config.state_path_in(&config_dir);
    if let Some(parent) = state_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory {}", parent.display()))?;
    }

    let pipeline = build_pipeline(&config, state_path, args.force)?;

    // Registered on first poll and kept for the whole process, so a Ctrl-C
    // during a run is not lost
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    if !args.daemon {
        tokio::select! {
            result = pipeline.run_once() => {
                result.context("Pipeline run failed")?.log();
            }
            _ = shutdown => {
                tracing::info!("Interrupted, entry in flight left unrecorded");
            }
        }
        return Ok(());
    }

    pipeline
        .run_until(Duration::from_secs(args.interval_minutes * 60), shutdown)
        .await;
    Ok(())
}

fn build_pipeline(config: &Config, state_path: PathBuf, force: bool) -> Result<Pipeline> {
    let http_client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .pool_idle_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;

    let surface = BlueskyClient::new(http_client.clone(), config.service_url()?)
        .with_langs(config.post_langs.clone());
    let publisher = Publisher::new(Arc::new(surface), config.credentials()?);

    let components = Components {
        feed: Arc::new(HttpFeedFetcher::new(http_client.clone(), config.feed_url()?)),
        pages: Arc::new(
            PageEnricher::new(http_client.clone()).with_fallback_image(config.fallback_image_url()?),
        ),
        images: Arc::new(ImageCompressor::new(http_client)),
        publisher,
        clock: Arc::new(SystemClock),
        jitter: Arc::new(ThreadJitter),
    };

    tracing::info!(state = %state_path.display(), "Using dedup store");
    Ok(Pipeline::new(
        DedupStore::new(state_path),
        config.pipeline_settings(force),
        components,
    ))
}
