//! Periodic drift reconciliation worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::deploy::infra::InfraController;

/// Reconciler worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between two full sync passes
    pub interval: Duration,

    /// Initial delay before the first pass
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(900),
            initial_delay: Duration::from_secs(60),
        }
    }
}

/// Run the reconciler worker until `shutdown_signal` resolves
pub async fn run<S, F>(
    options: &Options,
    controller: &InfraController,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Drift reconciler starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Drift reconciler shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        debug!("Reconciling completed deployments...");
        match controller.sync_all(None).await {
            Ok(summary) if summary.drifted > 0 => {
                info!("{} of {} deployments drifted", summary.drifted, summary.checked);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Drift reconciliation failed: {}", e);
            }
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Drift reconciler shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
