//! Background task dispatcher
//!
//! Accepted requests return immediately; their work runs here. Concurrency is
//! bounded by a semaphore and every task runs under a supervisor, so a panic
//! still reaches the record through the task's abort handler.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error};

use crate::errors::PilotError;

/// What a background task was doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Apply,
    Destroy,
    Pipeline,
}

/// Published when a background task finishes
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub kind: TaskKind,
    pub record_id: String,
    pub result: Result<(), String>,
}

/// Dispatcher options
#[derive(Debug, Clone)]
pub struct Options {
    pub max_concurrent: usize,
    pub outcome_buffer: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            outcome_buffer: 256,
        }
    }
}

/// Spawns supervised, bounded background tasks
#[derive(Clone)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    outcomes: mpsc::Sender<TaskOutcome>,
    in_flight: Arc<watch::Sender<usize>>,
}

impl Dispatcher {
    pub fn new(options: &Options) -> (Self, mpsc::Receiver<TaskOutcome>) {
        let (outcomes, rx) = mpsc::channel(options.outcome_buffer.max(1));
        let (in_flight, _) = watch::channel(0usize);
        let dispatcher = Self {
            permits: Arc::new(Semaphore::new(options.max_concurrent.max(1))),
            outcomes,
            in_flight: Arc::new(in_flight),
        };
        (dispatcher, rx)
    }

    /// Run `task` in the background. If it panics, `on_abort` receives the
    /// panic message and must record the failure.
    pub fn spawn<T, A, AF>(&self, kind: TaskKind, record_id: &str, task: T, on_abort: A)
    where
        T: Future<Output = Result<(), PilotError>> + Send + 'static,
        A: FnOnce(String) -> AF + Send + 'static,
        AF: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let outcomes = self.outcomes.clone();
        let in_flight = self.in_flight.clone();
        let record_id = record_id.to_string();

        in_flight.send_modify(|n| *n += 1);
        tokio::spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => match tokio::spawn(task).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(join_error) => {
                        let reason = if join_error.is_panic() {
                            panic_message(join_error.into_panic())
                        } else {
                            "task was cancelled".to_string()
                        };
                        error!(record_id = %record_id, ?kind, "Background task aborted: {}", reason);
                        on_abort(reason.clone()).await;
                        Err(reason)
                    }
                },
                Err(_) => {
                    let reason = "dispatcher is shut down".to_string();
                    on_abort(reason.clone()).await;
                    Err(reason)
                }
            };

            debug!(record_id = %record_id, ?kind, ok = result.is_ok(), "Background task finished");
            if outcomes
                .send(TaskOutcome {
                    kind,
                    record_id,
                    result,
                })
                .await
                .is_err()
            {
                debug!("Outcome channel closed");
            }
            in_flight.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait until every spawned task has finished
    pub async fn drain(&self) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives in self, so this only errors if it was dropped
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
