use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod jobs;
pub mod ws;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/webhook", post(jobs::webhook_create_job))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/jobs/:id/retry", post(jobs::retry_job))
        .route("/jobs/:id/logs", get(ws::job_logs_ws))
        .route("/auth/stream-token", post(jobs::create_stream_token))
        .route("/health", get(jobs::health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
