//! Graceful shutdown helpers.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::sink::{BatchWriter, BoundedBatchSink};

/// Wait for Ctrl+C. Failing to install the handler counts as a signal so
/// the caller still drains.
pub async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
}

/// Drain `sink`, bounded by `limit`, and log the outcome and final stats.
///
/// Returns the number of records written by the final flush.
pub async fn drain_sink<R, W>(sink: &BoundedBatchSink<R, W>, limit: Duration) -> usize
where
    R: Send + Sync + 'static,
    W: BatchWriter<R>,
{
    let flushed = match tokio::time::timeout(limit, sink.drain()).await {
        Ok(Ok(flushed)) => {
            info!(flushed = flushed, "Sink drained");
            flushed
        }
        Ok(Err(e)) => {
            error!(error = %e, "Final flush failed");
            0
        }
        Err(_) => {
            warn!(
                pending = sink.len(),
                in_flight = sink.in_flight(),
                "Sink drain timed out after {:?}",
                limit
            );
            0
        }
    };

    let stats = sink.stats();
    info!(
        received = stats.records_received,
        flushed = stats.records_flushed,
        dropped = stats.records_dropped,
        requeued = stats.records_requeued,
        failed_flushes = stats.failed_flushes,
        "Sink statistics"
    );

    flushed
}
