//! Omnibox CLI - unified messaging inbox service

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use omnibox::channels::{ChannelManager, WebhookServer};
use omnibox::config::Config;
use omnibox::ingest::{IngestPipeline, DEFAULT_SUBSCRIBER_CAPACITY};
use omnibox::store::Store;

#[derive(Parser)]
#[command(name = "omnibox", version, about = "Unified messaging inbox service")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, global = true, default_value = "./omnibox.json")]
    config: PathBuf,

    /// Override the SQLite database path
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the ingestion service: channels, webhook listener, pipeline
    Serve,
    /// Seed the channels table from the configuration file
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load_from_path(&cli.config).context("loading configuration")?;
    if let Some(database) = cli.database {
        config.database.path = database;
    }

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Init => init(config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let store = Store::open(&config.database.path)
        .await
        .context("opening database")?;
    let pipeline = Arc::new(IngestPipeline::new(store.clone()));
    let manager = Arc::new(ChannelManager::new(
        store.clone(),
        Arc::clone(&pipeline),
        config.clone(),
    ));

    manager.initialize_all_channels().await?;

    let webhook = if config.webhook.enabled {
        let server = WebhookServer::new(config.webhook.clone(), Arc::clone(&manager));
        server.start().await?;
        Some(server)
    } else {
        warn!("webhook listener disabled in configuration");
        None
    };

    // Drain inbound events so traffic is visible even with no automation
    // attached yet.
    let mut inbound = pipeline.subscribe_messages(DEFAULT_SUBSCRIBER_CAPACITY).await;
    tokio::spawn(async move {
        while let Some(event) = inbound.recv().await {
            info!(
                channel_id = event.channel_id,
                from = %event.message.external_id,
                kind = event.message.kind.as_str(),
                "message ingested"
            );
        }
    });

    info!("omnibox is running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;

    info!("shutting down");
    if let Some(server) = webhook {
        server.stop().await;
    }
    manager.shutdown().await;
    store.close().await;
    Ok(())
}

async fn init(config: Config) -> anyhow::Result<()> {
    let store = Store::open(&config.database.path)
        .await
        .context("opening database")?;

    for seed in &config.channels {
        if store.channel_by_name(&seed.name).await?.is_some() {
            info!(channel = %seed.name, "channel already exists, skipping");
            continue;
        }
        let channel = store
            .create_channel(&seed.name, &seed.kind, &seed.config, seed.active)
            .await?;
        info!(channel = %channel.name, channel_id = channel.id, "channel created");
    }

    store.close().await;
    Ok(())
}
