use tokio_util::sync::CancellationToken;

/// Wait for SIGTERM or SIGINT.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

/// Cancel the root token, stop the ingest side, and flush the store.
pub async fn shutdown_sequence(state: crate::state::AppState, root: CancellationToken) {
    tracing::info!("Beginning shutdown sequence...");

    // Stop accepting new work: relay listener and background loops.
    root.cancel();

    // Close upstream sockets and the ingest pipeline.
    state.explorer.stop();

    // Give in-flight handler work a moment to drain.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    // Flush and close the store.
    state.db.close().await;

    tracing::info!("Shutdown sequence completed");
}
