//! API routes

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::handlers::{accounts, directory, health, stats};
use crate::state::AppState;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors_origins = state.engine.config().api.cors_origins.clone();
    let state = Arc::new(state);

    // Health check routes
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/ready", get(health::readiness))
        .with_state(state.clone());

    let stats_routes = Router::new()
        .route("/queue", get(stats::queue_stats))
        .route("/platform", get(stats::platform_stats))
        .with_state(state.clone());

    let account_routes = Router::new()
        .route("/", post(accounts::create_account))
        .route("/validate", post(accounts::validate_account))
        .route("/:id/test-connection", post(accounts::test_connection))
        .route("/:id/pause", post(accounts::pause_account))
        .route("/:id/resume", post(accounts::resume_account))
        .route("/:id/recompute-health", post(accounts::recompute_health))
        .with_state(state.clone());

    let directory_routes = Router::new()
        .route("/import", post(directory::import_directory))
        .with_state(state);

    let router = Router::new()
        .nest("/health", health_routes)
        .nest("/stats", stats_routes)
        .nest("/accounts", account_routes)
        .nest("/directory", directory_routes)
        .layer(TraceLayer::new_for_http());

    match cors_layer(&cors_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    Some(CorsLayer::new().allow_origin(allowed))
}
