//! Persistence contract for projects, sections, widgets and the data log.
//!
//! DESIGN
//! ======
//! Services and broker sessions only see the `DashboardStore` trait. The
//! production implementation is `PgStore`; tests run against an in-memory
//! store so session and assembly behaviour can be checked without Postgres.
//!
//! ERROR HANDLING
//! ==============
//! Every failure is returned to the caller as a `StoreError`. Request paths
//! turn it into a 500 for that request only; the inbound message pump logs it
//! and keeps going.

pub mod postgres;

#[cfg(test)]
pub mod memory;

use time::OffsetDateTime;
use uuid::Uuid;

pub use postgres::PgStore;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Row of the `projects` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRow {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub broker_client_id: String,
    pub broker_address: String,
    pub broker_port: i32,
    pub broker_protocol: String,
}

/// Fields required to insert a project.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub slug: String,
    pub broker_client_id: String,
    pub broker_address: String,
    pub broker_port: i32,
    pub broker_protocol: String,
}

/// Row of the `project_sections` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
}

/// Row of the `project_widgets` table. `config` is the stored blob exactly as
/// written; it is only decoded when a widget is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetRow {
    pub id: Uuid,
    pub section_id: Uuid,
    pub title: String,
    pub kind: String,
    pub config: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct NewWidget {
    pub section_id: Uuid,
    pub title: String,
    pub kind: String,
    pub config: Vec<u8>,
}

/// Row of the `data_logs` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLogRow {
    pub id: i64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// STORE TRAIT
// =============================================================================

/// Storage operations used by the dashboard. Listing methods return rows in
/// creation order.
#[async_trait::async_trait]
pub trait DashboardStore: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<ProjectRow>, StoreError>;

    async fn project_by_slug(&self, slug: &str) -> Result<Option<ProjectRow>, StoreError>;

    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the slug is already taken.
    async fn create_project(&self, project: NewProject) -> Result<ProjectRow, StoreError>;

    async fn list_sections(&self, project_id: Uuid) -> Result<Vec<SectionRow>, StoreError>;

    async fn section(&self, section_id: Uuid) -> Result<Option<SectionRow>, StoreError>;

    async fn create_section(&self, project_id: Uuid, name: &str) -> Result<SectionRow, StoreError>;

    /// Returns `false` when no section matched.
    async fn rename_section(&self, section_id: Uuid, name: &str) -> Result<bool, StoreError>;

    /// Delete a section together with all of its widgets. Returns `false` when
    /// no section matched.
    async fn delete_section(&self, section_id: Uuid) -> Result<bool, StoreError>;

    async fn list_widgets(&self, section_id: Uuid) -> Result<Vec<WidgetRow>, StoreError>;

    async fn widget(&self, widget_id: Uuid) -> Result<Option<WidgetRow>, StoreError>;

    async fn create_widget(&self, widget: NewWidget) -> Result<WidgetRow, StoreError>;

    /// Returns `false` when no widget matched.
    async fn update_widget(&self, widget_id: Uuid, title: &str, config: &[u8]) -> Result<bool, StoreError>;

    /// Returns `false` when no widget matched.
    async fn delete_widget(&self, widget_id: Uuid) -> Result<bool, StoreError>;

    async fn append_data_log(&self, topic: &str, payload: &[u8], at: OffsetDateTime) -> Result<(), StoreError>;

    /// Most recent `limit` rows for `topic`, newest first.
    async fn recent_data_logs(&self, topic: &str, limit: i64) -> Result<Vec<DataLogRow>, StoreError>;
}
