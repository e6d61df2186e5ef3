use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustforward::config::Config;
use rustforward::filter::LlmRelevanceFilter;
use rustforward::orchestrator::Orchestrator;
use rustforward::platform::telegram::TelegramClient;
use rustforward::platform::ChatClient;
use rustforward::state::{StateOptions, StateStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rustforward=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Model: {} ({})", config.llm.model, config.llm.provider);
    info!("  Target: {}", config.telegram.target_chat_id);
    info!("  Sources: {}", config.sources.len());
    info!("  Poll interval: {}s", config.polling.interval_secs);
    info!("  State: {}", config.state.database_path.display());

    let client = Arc::new(TelegramClient::new(
        &config.telegram.bot_token,
        config.telegram.fetch_timeout_secs,
    ));
    client.connect().await?;

    let filter = Arc::new(LlmRelevanceFilter::new(config.llm.clone()));
    let store = StateStore::open(
        &config.state.database_path,
        StateOptions::from(&config.state),
    )
    .context("Failed to open state database")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    info!("Forwarder is starting...");
    Orchestrator::from_config(&config, client, filter, store)
        .run(shutdown)
        .await?;

    info!("Forwarder stopped");
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    cancel_on_signal(shutdown, tokio::signal::ctrl_c(), terminate).await;
}

/// Cancel `shutdown` once either signal arrives. A Ctrl-C listener that
/// cannot be installed is logged, and SIGTERM alone still ends the run.
async fn cancel_on_signal(
    shutdown: CancellationToken,
    ctrl_c: impl Future<Output = std::io::Result<()>>,
    terminate: impl Future<Output = ()>,
) {
    let interrupt = async {
        if let Err(e) = ctrl_c.await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }

    info!("Shutdown requested, finishing in-flight work...");
    shutdown.cancel();
}
