//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::AppOptions;
use crate::app::state::AppState;
use crate::errors::PilotError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::dispatcher::TaskOutcome;
use crate::workers::{outcomes, reconciler};

/// Run the orchestrator until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), PilotError> {
    info!("Initializing stackpilot...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.max_shutdown_delay);

    if let Err(e) = init(&options, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start stackpilot: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), PilotError> {
    let (app_state, task_outcomes) = AppState::init(options).await?;
    let app_state = Arc::new(app_state);
    shutdown_manager.with_app_state(app_state.clone())?;

    recover_interrupted(&app_state).await;

    init_outcome_worker(task_outcomes, shutdown_manager)?;

    if let Some(reconciler_options) = &options.reconciler {
        init_reconciler_worker(
            reconciler_options.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    } else {
        info!("Periodic drift reconciliation disabled");
    }

    if options.enable_server {
        init_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(())
}

async fn recover_interrupted(app_state: &AppState) {
    match app_state.infra.recover_interrupted().await {
        Ok(0) => {}
        Ok(n) => warn!("Marked {} interrupted deployments as failed", n),
        Err(e) => error!("Failed to recover interrupted deployments: {}", e),
    }
    match app_state.applications.recover_interrupted().await {
        Ok(0) => {}
        Ok(n) => warn!("Marked {} interrupted application pipelines as errored", n),
        Err(e) => error!("Failed to recover interrupted applications: {}", e),
    }
}

/// Stopped separately, after background tasks have drained
fn init_outcome_worker(
    task_outcomes: mpsc::Receiver<TaskOutcome>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), PilotError> {
    info!("Initializing outcome worker...");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        outcomes::run(
            task_outcomes,
            Box::pin(async move {
                let _ = stop_rx.await;
            }),
        )
        .await;
    });

    shutdown_manager.with_outcome_worker(handle, stop_tx)
}

fn init_reconciler_worker(
    options: reconciler::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PilotError> {
    info!("Initializing drift reconciler (every {:?})...", options.interval);

    let handle = tokio::spawn(async move {
        reconciler::run(
            &options,
            &app_state.infra,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_reconciler_worker_handle(handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PilotError> {
    info!("Initializing HTTP API...");

    let server_state = ServerState::new(app_state.infra.clone(), app_state.applications.clone());

    let handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    max_shutdown_delay: Duration,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), PilotError>>>,
    reconciler_worker_handle: Option<JoinHandle<()>>,
    outcome_worker_handle: Option<JoinHandle<()>>,
    outcome_worker_stop: Option<oneshot::Sender<()>>,
}

impl ShutdownManager {
    fn new(shutdown_tx: broadcast::Sender<()>, max_shutdown_delay: Duration) -> Self {
        Self {
            shutdown_tx,
            max_shutdown_delay,
            app_state: None,
            server_handle: None,
            reconciler_worker_handle: None,
            outcome_worker_handle: None,
            outcome_worker_stop: None,
        }
    }

    fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), PilotError> {
        if self.app_state.is_some() {
            return Err(PilotError::Internal("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), PilotError>>,
    ) -> Result<(), PilotError> {
        if self.server_handle.is_some() {
            return Err(PilotError::Internal("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    fn with_reconciler_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), PilotError> {
        if self.reconciler_worker_handle.is_some() {
            return Err(PilotError::Internal("reconciler_handle already set".to_string()));
        }
        self.reconciler_worker_handle = Some(handle);
        Ok(())
    }

    fn with_outcome_worker(
        &mut self,
        handle: JoinHandle<()>,
        stop: oneshot::Sender<()>,
    ) -> Result<(), PilotError> {
        if self.outcome_worker_handle.is_some() {
            return Err(PilotError::Internal("outcome_handle already set".to_string()));
        }
        self.outcome_worker_handle = Some(handle);
        self.outcome_worker_stop = Some(stop);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), PilotError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.max_shutdown_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), PilotError> {
        info!("Shutting down stackpilot...");

        // 1. Stop accepting requests
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| PilotError::Internal(e.to_string()))??;
        }

        // 2. Reconciler
        if let Some(handle) = self.reconciler_worker_handle.take() {
            handle.await.map_err(|e| PilotError::Internal(e.to_string()))?;
        }

        // 3. Background tasks already accepted
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await;
        }

        // 4. Outcome worker drains what the tasks published
        if let Some(stop) = self.outcome_worker_stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.outcome_worker_handle.take() {
            handle.await.map_err(|e| PilotError::Internal(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
