//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::errors::PilotError;
use crate::models::application::{Application, CreateApplication};
use crate::models::deployment::{CreateDeployment, Deployment, SyncSummary};
use crate::server::state::ServerState;
use crate::utils::version_info;

type ApiResult<T> = Result<T, PilotError>;

impl IntoResponse for PilotError {
    fn into_response(self) -> Response {
        let status = match &self {
            PilotError::Validation(_)
            | PilotError::InvalidTransition(_)
            | PilotError::Configuration(_) => StatusCode::BAD_REQUEST,
            PilotError::NotFound(_) => StatusCode::NOT_FOUND,
            PilotError::Conflict(_) => StatusCode::CONFLICT,
            PilotError::Credential(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// Malformed request bodies get the same JSON error shape as every other failure
impl From<JsonRejection> for PilotError {
    fn from(rejection: JsonRejection) -> Self {
        PilotError::Validation(rejection.body_text())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Optional `?owner=` filter
#[derive(Debug, Default, Deserialize)]
pub struct OwnerQuery {
    pub owner: Option<String>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "stackpilot".to_string(),
        version: version_info().version,
    })
}

pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

// ================================ DEPLOYMENTS ==================================== //

pub async fn create_deployment_handler(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<CreateDeployment>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let ack = state.infra.create(request).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

pub async fn list_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Vec<Deployment>>> {
    Ok(Json(state.infra.list(query.owner.as_deref()).await?))
}

pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Deployment>> {
    Ok(Json(state.infra.get(&id).await?))
}

pub async fn destroy_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let ack = state.infra.destroy(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

/// Removes the record only; cloud resources are left alone
pub async fn delete_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Deployment>> {
    Ok(Json(state.infra.delete_record(&id).await?))
}

pub async fn sync_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Deployment>> {
    Ok(Json(state.infra.sync_one(&id).await?))
}

pub async fn sync_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<SyncSummary>> {
    Ok(Json(state.infra.sync_all(query.owner.as_deref()).await?))
}

// ================================ APPLICATIONS =================================== //

pub async fn create_application_handler(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<CreateApplication>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let ack = state.applications.create(request).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

pub async fn list_applications_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Vec<Application>>> {
    Ok(Json(state.applications.list(query.owner.as_deref()).await?))
}

pub async fn get_application_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Application>> {
    Ok(Json(state.applications.get(&id).await?))
}

pub async fn redeploy_application_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let ack = state.applications.redeploy(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

pub async fn stop_application_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Application>> {
    Ok(Json(state.applications.stop(&id).await?))
}

pub async fn start_application_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Application>> {
    Ok(Json(state.applications.start(&id).await?))
}

pub async fn cancel_application_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Application>> {
    Ok(Json(state.applications.cancel(&id).await?))
}

pub async fn delete_application_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Application>> {
    Ok(Json(state.applications.delete(&id).await?))
}
