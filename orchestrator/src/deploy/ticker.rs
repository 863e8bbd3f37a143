//! Progress tickers
//!
//! While a long stage runs, a ticker appends elapsed-time lines to the
//! application log so polling clients can see the pipeline is alive.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::PilotError;
use crate::models::application::{AppStatus, Application};
use crate::services::records::RecordStore;

pub const CLONE_TICK: Duration = Duration::from_secs(10);
pub const BUILD_TICK: Duration = Duration::from_secs(15);

/// Clone progress message; escalates past 30s, 60s and 120s
pub fn clone_message(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    match secs {
        0..=29 => format!("Cloning repository... ({}s)", secs),
        30..=59 => format!("Still cloning ({}s); larger repositories take a little longer", secs),
        60..=119 => format!(
            "Clone is taking longer than usual ({}s); checking the repository host",
            secs
        ),
        _ => format!(
            "Clone has been running for {}s; very large repositories or a slow host can cause this",
            secs
        ),
    }
}

pub fn build_message(elapsed: Duration) -> String {
    format!("Building image... ({}s elapsed)", elapsed.as_secs())
}

/// Appends a line every `interval` until dropped
pub struct Ticker {
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Lines are only written while the record is still in `stage`
    pub fn start(
        store: Arc<dyn RecordStore<Application>>,
        application_id: String,
        stage: AppStatus,
        interval: Duration,
        message: fn(Duration) -> String,
    ) -> Self {
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(started + interval, interval);
            loop {
                tick.tick().await;
                let line = message(started.elapsed());
                let result = store
                    .modify(
                        &application_id,
                        Box::new(move |app: &mut Application| {
                            if app.status != stage {
                                return Err(PilotError::InvalidTransition(format!(
                                    "no longer {}",
                                    stage
                                )));
                            }
                            app.push_log(line);
                            Ok(())
                        }),
                    )
                    .await;
                if let Err(e) = result {
                    debug!(application_id = %application_id, "Skipped progress line: {}", e);
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
