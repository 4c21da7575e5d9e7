use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::error::ServiceError;
use crate::service::{
    AccessOutcome, ExtendOutcome, ResourcesSummary, RunOutcome, RunningCluster, Service,
    StatusOutcome, StopOutcome,
};

/// The control surface: one route per service method, no business logic.
pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/api/run/:cluster_db_id", post(run))
        .route("/api/status", post(status))
        .route("/api/access_info", post(access_info))
        .route("/api/restart", post(restart))
        .route("/api/stop", post(stop))
        .route("/api/extend_ttl", post(extend_ttl))
        .route("/api/running_clusters", get(running_clusters))
        .route("/api/resources/summary", get(resources_summary))
        .with_state(service)
}

#[derive(Deserialize)]
struct RunRequest {
    session_id: String,
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct SessionRequest {
    session_id: String,
}

struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

fn status_code(error: &ServiceError) -> StatusCode {
    match error {
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::NoAvailablePorts
        | ServiceError::Env(_)
        | ServiceError::Cluster(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn run(
    State(service): State<Arc<Service>>,
    Path(cluster_db_id): Path<i64>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunOutcome>, ApiError> {
    let outcome = service
        .run(cluster_db_id, request.variables, &request.session_id)
        .await?;
    Ok(Json(outcome))
}

async fn status(
    State(service): State<Arc<Service>>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<StatusOutcome>, ApiError> {
    Ok(Json(service.status(&request.session_id).await?))
}

async fn access_info(
    State(service): State<Arc<Service>>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<AccessOutcome>, ApiError> {
    Ok(Json(service.access_info(&request.session_id).await?))
}

async fn restart(
    State(service): State<Arc<Service>>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<StopOutcome>, ApiError> {
    Ok(Json(service.restart(&request.session_id).await?))
}

async fn stop(
    State(service): State<Arc<Service>>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<StopOutcome>, ApiError> {
    Ok(Json(service.stop(&request.session_id).await?))
}

async fn extend_ttl(
    State(service): State<Arc<Service>>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<ExtendOutcome>, ApiError> {
    Ok(Json(service.extend_ttl(&request.session_id).await?))
}

async fn running_clusters(State(service): State<Arc<Service>>) -> Json<Vec<RunningCluster>> {
    Json(service.running_clusters().await)
}

async fn resources_summary(State(service): State<Arc<Service>>) -> Json<ResourcesSummary> {
    Json(service.resources_summary().await)
}
