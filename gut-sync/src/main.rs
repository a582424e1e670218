// gut-sync - offline-first sync daemon for the gut tracker
// Entry point and application setup

use anyhow::Context;
use gut_sync::app;
use gut_sync::config::ClientConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_ENV: &str = "GUT_SYNC_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gut_sync=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting gut-sync");

    let config_path = std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("gut-sync.json"));
    let config = ClientConfig::load(&config_path)
        .await
        .with_context(|| format!("loading config from {:?}", config_path))?;

    let state = app::bootstrap(config).await.context("bootstrapping")?;
    let ctx = state.entries.initialize().await.context("initializing entries")?;
    tracing::info!("Ready in {:?} mode (user {})", ctx.mode, ctx.user_id);

    let sync = state
        .entries
        .start_background_sync(state.config.sync_interval());

    let timeline = state.entries.timeline().await?;
    tracing::info!("Timeline holds {} entries", timeline.len());

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Shutting down");

    sync.stop().await;
    Ok(())
}
