//! Consumer of background task outcomes

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::workers::dispatcher::TaskOutcome;

/// Tallies kept for the shutdown log line
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub succeeded: usize,
    pub failed: usize,
}

/// Log every outcome until the channel closes or shutdown is signalled
pub async fn run(
    mut outcomes: mpsc::Receiver<TaskOutcome>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> OutcomeCounts {
    let mut counts = OutcomeCounts::default();

    loop {
        let outcome = tokio::select! {
            _ = &mut shutdown_signal => break,
            outcome = outcomes.recv() => match outcome {
                Some(outcome) => outcome,
                None => break,
            },
        };
        record(&mut counts, &outcome);
    }

    // Tasks that finished while shutting down
    while let Ok(outcome) = outcomes.try_recv() {
        record(&mut counts, &outcome);
    }

    info!(
        succeeded = counts.succeeded,
        failed = counts.failed,
        "Outcome worker stopped"
    );
    counts
}

fn record(counts: &mut OutcomeCounts, outcome: &TaskOutcome) {
    match &outcome.result {
        Ok(()) => {
            counts.succeeded += 1;
            info!(kind = ?outcome.kind, record_id = %outcome.record_id, "Background task finished");
        }
        Err(e) => {
            counts.failed += 1;
            warn!(
                kind = ?outcome.kind,
                record_id = %outcome.record_id,
                "Background task failed: {}",
                e
            );
        }
    }
}
