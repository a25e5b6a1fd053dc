//! Dashboard runtime routes: connect, disconnect, status, data and button
//! presses for one project.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use crate::services::connection;
use crate::services::dashboard::DashboardError;
use crate::services::data::{self, WidgetData};
use crate::state::AppState;
use crate::store::StoreError;

/// `POST /projects/:slug/connect`: start connecting in the background.
pub async fn connect(State(state): State<AppState>, Path(slug): Path<String>) -> Result<StatusCode, StatusCode> {
    connection::connect_project(&state, &slug)
        .await
        .map_err(dashboard_error_to_status)?;
    Ok(StatusCode::ACCEPTED)
}

/// `POST /projects/:slug/disconnect`: disconnect in the background.
pub async fn disconnect(State(state): State<AppState>, Path(slug): Path<String>) -> Result<StatusCode, StatusCode> {
    connection::disconnect_project(&state, &slug)
        .await
        .map_err(dashboard_error_to_status)?;
    Ok(StatusCode::ACCEPTED)
}

/// `GET /projects/:slug/connection`: `online` or `offline` as plain text.
pub async fn connection_status(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<&'static str, StatusCode> {
    let status = connection::connection_status(&state, &slug)
        .await
        .map_err(dashboard_error_to_status)?;
    Ok(status.as_str())
}

/// `GET /projects/:slug/data`: widget values, or `null` before the first connect.
pub async fn data(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Option<Vec<WidgetData>>>, StatusCode> {
    let widgets = data::assemble(&state, &slug)
        .await
        .map_err(dashboard_error_to_status)?;
    Ok(Json(widgets))
}

#[derive(Deserialize)]
pub struct SubmitValueBody {
    pub id: Uuid,
}

/// `POST /projects/:slug/submit-value`: publish a button's message.
pub async fn submit_value(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(body): Json<SubmitValueBody>,
) -> Result<StatusCode, StatusCode> {
    let pending = data::submit_value(&state, &slug, body.id)
        .await
        .map_err(dashboard_error_to_status)?;
    tokio::spawn(pending.send());
    Ok(StatusCode::ACCEPTED)
}

pub(crate) fn dashboard_error_to_status(err: DashboardError) -> StatusCode {
    match err {
        DashboardError::ProjectNotFound(_) | DashboardError::SectionNotFound(_) | DashboardError::WidgetNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        DashboardError::InvalidInput(_) | DashboardError::Config(_) => StatusCode::BAD_REQUEST,
        DashboardError::Offline | DashboardError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
        DashboardError::Broker(e) => {
            error!(error = %e, "project broker settings unusable");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        DashboardError::Store(e) => {
            error!(error = %e, "store request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
#[path = "projects_test.rs"]
mod tests;
