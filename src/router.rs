//! Request routing for the delta tracking API.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::config::Config;
use crate::enrich::EnrichmentProxy;
use crate::handlers::{delta, driver};
use crate::registry::DriverRegistry;
use crate::store::DeltaStore;

/// API path prefix shared by every route.
pub const API_PREFIX: &str = "/apis/snapdelta/v1";

/// Application state shared between handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn DeltaStore>,
    pub registry: Arc<dyn DriverRegistry>,
    pub proxy: Arc<EnrichmentProxy>,
}

/// Creates the main router for the delta service.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Namespaced delta records
        .route(
            "/namespaces/:namespace/deltas",
            post(delta::create_delta).get(delta::list_deltas),
        )
        .route(
            "/namespaces/:namespace/deltas/:name",
            get(delta::get_delta)
                .put(delta::update_delta)
                .delete(delta::delete_delta),
        )
        // Enrichment subresource
        .route(
            "/namespaces/:namespace/deltas/:name/changedblocks",
            get(delta::enrich_delta),
        )
        // Cross-namespace listing and watching
        .route("/deltas", get(delta::list_all_deltas))
        // Driver endpoint registry
        .route(
            "/drivers",
            post(driver::register_driver).get(driver::list_drivers),
        )
        .route("/drivers/:name", get(driver::get_driver))
        .with_state(state);

    Router::new().nest(API_PREFIX, api)
}
