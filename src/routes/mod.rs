//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Runtime endpoints live under `/projects/{slug}` and return bare values
//! (status text, data JSON, `202` for background work). Management endpoints
//! live under `/api/projects` and speak JSON throughout.

pub mod manage;
pub mod projects;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Full application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/projects/{slug}/connect", post(projects::connect))
        .route("/projects/{slug}/disconnect", post(projects::disconnect))
        .route("/projects/{slug}/connection", get(projects::connection_status))
        .route("/projects/{slug}/data", get(projects::data))
        .route("/projects/{slug}/submit-value", post(projects::submit_value))
        .route("/api/projects", get(manage::list_projects).post(manage::create_project))
        .route("/api/projects/{slug}", get(manage::get_project))
        .route("/api/projects/{slug}/sections", post(manage::create_section))
        .route(
            "/api/projects/{slug}/sections/{id}",
            patch(manage::rename_section).delete(manage::delete_section),
        )
        .route("/api/projects/{slug}/widgets", post(manage::create_widget))
        .route(
            "/api/projects/{slug}/widgets/{id}",
            patch(manage::update_widget).delete(manage::delete_widget),
        )
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
