//! Driver endpoint registration handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};

use crate::error::DeltaResult;
use crate::models::DriverEndpoint;
use crate::router::AppState;

use super::json_response;

/// POST /drivers - Register a driver endpoint.
///
/// Re-posting an identical entry succeeds; differing connection info for the
/// same driver name is a conflict.
pub async fn register_driver(
    State(state): State<AppState>,
    axum::Json(endpoint): axum::Json<DriverEndpoint>,
) -> DeltaResult<Response> {
    let registered = state.registry.register(endpoint).await?;
    Ok(json_response(StatusCode::CREATED, &registered))
}

/// GET /drivers/{name} - Resolve a registered driver endpoint.
pub async fn get_driver(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> DeltaResult<Response> {
    let endpoint = state.registry.resolve(&name).await?;
    Ok(json_response(StatusCode::OK, &endpoint))
}

/// GET /drivers - List registered driver endpoints.
pub async fn list_drivers(State(state): State<AppState>) -> DeltaResult<Response> {
    let endpoints = state.registry.list().await?;
    Ok(json_response(StatusCode::OK, &endpoints))
}
