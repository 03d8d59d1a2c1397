mod config;
mod shutdown;
mod state;
mod telemetry;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::load().context("Failed to load configuration")?;

    // Initialize telemetry
    telemetry::init_telemetry(&config.telemetry).context("Failed to initialize telemetry")?;

    tracing::info!("Starting Beacon...");
    tracing::info!("Environment: {}", config.telemetry.environment);

    // Initialize application state (database, stores, services)
    let mut app_state = state::AppState::new(config)
        .await
        .context("Failed to initialize application state")?;

    let root = CancellationToken::new();

    // Wire the curator's outbox into the relay pool: accepted torrents and
    // decision publications fan out to every upstream.
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    app_state.curator.set_outbox(outbox_tx);
    {
        let pool = app_state.explorer.pool();
        let cancel = root.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = outbox_rx.recv() => match event {
                        Some(event) => {
                            pool.publish(&event, None).await;
                        }
                        None => return,
                    }
                }
            }
        });
    }

    // Ingest pipeline
    app_state.explorer.start();

    // Relay server
    if let Some(relay_server) = app_state.relay_server.take() {
        let cancel = root.clone();
        tokio::spawn(async move {
            if let Err(e) = relay_server.serve(cancel).await {
                tracing::error!("Relay server error: {}", e);
            }
        });
    }

    // Discovery
    if app_state.config.discovery.enabled {
        let discovery = Arc::clone(&app_state.discovery);
        let scan_urls = app_state.config.explorer.relays.clone();
        tokio::spawn(discovery.run(scan_urls, root.clone()));
    }

    // SLA enforcement
    {
        let sla = Arc::clone(&app_state.sla);
        tokio::spawn(sla.run(root.clone()));
    }

    tracing::info!("Beacon started successfully");

    // Wait for a shutdown signal, then unwind.
    shutdown::shutdown_signal().await;
    shutdown::shutdown_sequence(app_state, root).await;

    tracing::info!("Beacon stopped");
    Ok(())
}
