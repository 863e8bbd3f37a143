//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::PilotError;
use crate::server::handlers::*;
use crate::server::state::ServerState;

/// Build the API router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Infrastructure deployments
        .route(
            "/deployments",
            post(create_deployment_handler).get(list_deployments_handler),
        )
        .route("/deployments/sync", post(sync_deployments_handler))
        .route(
            "/deployments/{id}",
            get(get_deployment_handler).delete(delete_deployment_handler),
        )
        .route("/deployments/{id}/destroy", post(destroy_deployment_handler))
        .route("/deployments/{id}/sync", post(sync_deployment_handler))
        // Applications
        .route(
            "/applications",
            post(create_application_handler).get(list_applications_handler),
        )
        .route(
            "/applications/{id}",
            get(get_application_handler).delete(delete_application_handler),
        )
        .route("/applications/{id}/redeploy", post(redeploy_application_handler))
        .route("/applications/{id}/stop", post(stop_application_handler))
        .route("/applications/{id}/start", post(start_application_handler))
        .route("/applications/{id}/cancel", post(cancel_application_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), PilotError>>, PilotError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr).await?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(PilotError::from)
    });

    Ok(handle)
}
