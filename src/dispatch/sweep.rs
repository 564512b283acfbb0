//! Periodic dead-job sweep.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::dispatch::Dispatcher;

/// Run `Dispatcher::sweep` every `interval` until the handle is aborted.
pub fn spawn_sweep_ticker(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match dispatcher.sweep().await {
                Ok(report) if !report.is_empty() => {
                    info!(reclaimed = report.len(), "Sweep reclaimed dead jobs");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Sweep failed"),
            }
        }
    })
}
