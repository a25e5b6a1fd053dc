//! Project, section and widget management routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::routes::projects::dashboard_error_to_status;
use crate::services::connection::{self, ConnectionSnapshot};
use crate::services::dashboard::{self, NewWidgetInput, ProjectInput, WidgetUpdate};
use crate::state::AppState;
use crate::store::{ProjectRow, SectionRow, WidgetRow};
use crate::widgets;

#[derive(Debug, Serialize)]
pub struct ProjectResponse {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub broker_client_id: String,
    pub broker_address: String,
    pub broker_port: i32,
    pub broker_protocol: String,
}

#[derive(Debug, Serialize)]
pub struct ProjectDetailResponse {
    #[serde(flatten)]
    pub project: ProjectResponse,
    pub connection: ConnectionSnapshot,
    pub sections: Vec<SectionResponse>,
}

#[derive(Debug, Serialize)]
pub struct SectionResponse {
    pub id: Uuid,
    pub name: String,
    pub widgets: Vec<WidgetResponse>,
}

/// A widget with its decoded config. When the stored blob does not decode,
/// `config` carries the raw text and `error` says why.
#[derive(Debug, Serialize)]
pub struct WidgetResponse {
    pub id: Uuid,
    pub section_id: Uuid,
    pub title: String,
    pub kind: String,
    pub config: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn to_project_response(row: ProjectRow) -> ProjectResponse {
    ProjectResponse {
        id: row.id,
        name: row.name,
        slug: row.slug,
        broker_client_id: row.broker_client_id,
        broker_address: row.broker_address,
        broker_port: row.broker_port,
        broker_protocol: row.broker_protocol,
    }
}

fn to_widget_response(row: WidgetRow) -> WidgetResponse {
    let (config, error) = match widgets::resolve(&row) {
        Ok(config) => (config.to_json(), None),
        Err(e) => {
            let raw = row
                .config
                .as_deref()
                .map_or(serde_json::Value::Null, |bytes| String::from_utf8_lossy(bytes).into_owned().into());
            (raw, Some(e.to_string()))
        }
    };
    WidgetResponse { id: row.id, section_id: row.section_id, title: row.title, kind: row.kind, config, error }
}

fn to_section_response(section: SectionRow, widgets: Vec<WidgetRow>) -> SectionResponse {
    SectionResponse {
        id: section.id,
        name: section.name,
        widgets: widgets.into_iter().map(to_widget_response).collect(),
    }
}

// =============================================================================
// PROJECTS
// =============================================================================

/// `GET /api/projects`: list projects.
pub async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<ProjectResponse>>, StatusCode> {
    let rows = dashboard::list_projects(state.store.as_ref())
        .await
        .map_err(dashboard_error_to_status)?;
    Ok(Json(rows.into_iter().map(to_project_response).collect()))
}

/// `POST /api/projects`: create a project.
pub async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<ProjectInput>,
) -> Result<(StatusCode, Json<ProjectResponse>), StatusCode> {
    let row = dashboard::create_project(state.store.as_ref(), body)
        .await
        .map_err(dashboard_error_to_status)?;
    Ok((StatusCode::CREATED, Json(to_project_response(row))))
}

/// `GET /api/projects/:slug`: project with its connection, sections and widgets.
pub async fn get_project(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<ProjectDetailResponse>, StatusCode> {
    let store = state.store.as_ref();
    let project = dashboard::project_by_slug(store, &slug)
        .await
        .map_err(dashboard_error_to_status)?;
    let layout = dashboard::load_layout(store, project.id)
        .await
        .map_err(|e| dashboard_error_to_status(e.into()))?;
    let connection = connection::connection_snapshot(&state, project.id).await;

    Ok(Json(ProjectDetailResponse {
        project: to_project_response(project),
        connection,
        sections: layout
            .into_iter()
            .map(|entry| to_section_response(entry.section, entry.widgets))
            .collect(),
    }))
}

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Deserialize)]
pub struct SectionBody {
    pub name: String,
}

/// `POST /api/projects/:slug/sections`: add a section.
pub async fn create_section(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(body): Json<SectionBody>,
) -> Result<(StatusCode, Json<SectionResponse>), StatusCode> {
    let section = dashboard::create_section(state.store.as_ref(), &slug, &body.name)
        .await
        .map_err(dashboard_error_to_status)?;
    Ok((StatusCode::CREATED, Json(to_section_response(section, Vec::new()))))
}

/// `PATCH /api/projects/:slug/sections/:id`: rename a section.
pub async fn rename_section(
    State(state): State<AppState>,
    Path((slug, section_id)): Path<(String, Uuid)>,
    Json(body): Json<SectionBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    dashboard::rename_section(state.store.as_ref(), &slug, section_id, &body.name)
        .await
        .map_err(dashboard_error_to_status)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `DELETE /api/projects/:slug/sections/:id`: delete a section and its widgets.
pub async fn delete_section(
    State(state): State<AppState>,
    Path((slug, section_id)): Path<(String, Uuid)>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    dashboard::delete_section(state.store.as_ref(), &slug, section_id)
        .await
        .map_err(dashboard_error_to_status)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// =============================================================================
// WIDGETS
// =============================================================================

/// `POST /api/projects/:slug/widgets`: add a widget to a section.
pub async fn create_widget(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(body): Json<NewWidgetInput>,
) -> Result<(StatusCode, Json<WidgetResponse>), StatusCode> {
    let row = dashboard::create_widget(state.store.as_ref(), &slug, body)
        .await
        .map_err(dashboard_error_to_status)?;
    Ok((StatusCode::CREATED, Json(to_widget_response(row))))
}

/// `PATCH /api/projects/:slug/widgets/:id`: edit title and config fields.
pub async fn update_widget(
    State(state): State<AppState>,
    Path((slug, widget_id)): Path<(String, Uuid)>,
    Json(body): Json<WidgetUpdate>,
) -> Result<Json<WidgetResponse>, StatusCode> {
    let row = dashboard::update_widget(state.store.as_ref(), &slug, widget_id, body)
        .await
        .map_err(dashboard_error_to_status)?;
    Ok(Json(to_widget_response(row)))
}

/// `DELETE /api/projects/:slug/widgets/:id`: delete a widget.
pub async fn delete_widget(
    State(state): State<AppState>,
    Path((slug, widget_id)): Path<(String, Uuid)>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    dashboard::delete_widget(state.store.as_ref(), &slug, widget_id)
        .await
        .map_err(dashboard_error_to_status)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[cfg(test)]
#[path = "manage_test.rs"]
mod tests;
