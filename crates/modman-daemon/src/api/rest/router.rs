//! API Router configuration

use super::handlers;
use super::state::AppState;
use axum::{
    routing::{delete, get, patch},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main API router
pub fn create_router(state: AppState, enable_cors: bool) -> Router {
    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        // Deployments
        .route(
            "/deployments",
            get(handlers::list_deployments).post(handlers::create_deployment),
        )
        .route(
            "/deployments/:id",
            get(handlers::get_deployment)
                .patch(handlers::update_deployment)
                .delete(handlers::delete_deployment),
        )
        .route("/deployments/:id/start", patch(handlers::start_deployment))
        .route("/deployments/:id/stop", patch(handlers::stop_deployment))
        // Batch
        .route(
            "/deployments-batch/start",
            patch(handlers::start_deployments),
        )
        .route("/deployments-batch/stop", patch(handlers::stop_deployments))
        .route("/deployments-batch", delete(handlers::delete_deployments))
        // Jobs
        .route("/jobs", get(handlers::list_jobs))
        .route("/jobs/:id", get(handlers::get_job))
        .route("/jobs/:id/cancel", patch(handlers::cancel_job));

    let router = Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http());

    let router = if enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}
