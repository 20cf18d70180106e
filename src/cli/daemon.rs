use crate::pool::Filepool;
use anyhow::Result;
use tokio::signal;

/// Run the queue loop until Ctrl+C
pub async fn run_daemon(pool: Filepool) -> Result<()> {
    tracing::info!("Starting daemon mode...");
    tracing::info!("Press Ctrl+C to stop");

    let Some(worker) = pool.start_queue() else {
        anyhow::bail!("Queue processing is already running");
    };

    let mut events = pool.subscribe();
    let log_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!("Event: {:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event log lagged, skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Wait for Ctrl+C
    match signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        Err(e) => {
            tracing::error!("Error waiting for Ctrl+C: {}", e);
        }
    }

    worker.stop();
    log_handle.abort();

    let remaining = pool.get_queue_entries()?.len();
    tracing::info!("Daemon stopped with {} files still queued", remaining);
    println!("Stopped. {} files still queued.", remaining);

    Ok(())
}
