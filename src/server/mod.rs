pub mod health;
pub mod rate_limit;
pub mod routes;

use std::sync::Arc;
use std::time::Instant;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::daemon::dispatcher::Dispatcher;
use crate::daemon::resources::ResourceManager;
use crate::models::PipelineConfig;
use crate::storage::JobLayout;
use crate::validation::UploadPolicy;
use rate_limit::RateLimits;

/// Shared application state for the Axum server.
pub struct AppState {
    pub config: Arc<PipelineConfig>,
    pub layout: JobLayout,
    pub dispatcher: Arc<Dispatcher>,
    pub resources: Arc<ResourceManager>,
    pub policy: UploadPolicy,
    pub limits: RateLimits,
    pub start_time: Instant,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload = post(routes::upload_file).route_layer(middleware::from_fn_with_state(
        Arc::clone(&state),
        rate_limit::limit_uploads,
    ));
    let submit = post(routes::submit_stage).route_layer(middleware::from_fn_with_state(
        Arc::clone(&state),
        rate_limit::limit_submissions,
    ));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/jobs", post(routes::create_job))
        .route("/api/jobs/{job_id}", get(routes::get_job))
        .route("/api/jobs/{job_id}/uploads/{file_name}", upload)
        .route(
            "/api/jobs/{job_id}/stages/{stage}",
            get(routes::get_stage).merge(submit),
        )
        .route(
            "/api/jobs/{job_id}/stages/{stage}/abandon",
            post(routes::abandon_stage),
        )
        .route("/api/resources/usage", get(routes::usage))
        .route("/api/resources/oldest", get(routes::oldest_jobs))
        .route("/api/resources/cleanup", post(routes::cleanup))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}
