//! Request handlers for the delta service API.

pub mod delta;
pub mod driver;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Builds a JSON response with the given status.
pub(crate) fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
    let mut response = Json(serde_json::json!(body)).into_response();
    *response.status_mut() = status;
    response
}
