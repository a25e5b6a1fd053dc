//! `PostgreSQL` implementation of [`DashboardStore`].

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{DashboardStore, DataLogRow, NewProject, NewWidget, ProjectRow, SectionRow, StoreError, WidgetRow};

type ProjectTuple = (Uuid, String, String, String, String, i32, String);

fn project_from_tuple(row: ProjectTuple) -> ProjectRow {
    let (id, name, slug, broker_client_id, broker_address, broker_port, broker_protocol) = row;
    ProjectRow { id, name, slug, broker_client_id, broker_address, broker_port, broker_protocol }
}

fn widget_from_tuple((id, section_id, title, kind, config): (Uuid, Uuid, String, String, Option<Vec<u8>>)) -> WidgetRow {
    WidgetRow { id, section_id, title, kind, config }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// Store backed by the shared SQLx pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DashboardStore for PgStore {
    async fn list_projects(&self) -> Result<Vec<ProjectRow>, StoreError> {
        let rows = sqlx::query_as::<_, ProjectTuple>(
            "SELECT id, name, slug, broker_client_id, broker_address, broker_port, broker_protocol
             FROM projects
             ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(project_from_tuple).collect())
    }

    async fn project_by_slug(&self, slug: &str) -> Result<Option<ProjectRow>, StoreError> {
        let row = sqlx::query_as::<_, ProjectTuple>(
            "SELECT id, name, slug, broker_client_id, broker_address, broker_port, broker_protocol
             FROM projects
             WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(project_from_tuple))
    }

    async fn create_project(&self, project: NewProject) -> Result<ProjectRow, StoreError> {
        let id = Uuid::new_v4();
        let result = sqlx::query(
            "INSERT INTO projects (id, name, slug, broker_client_id, broker_address, broker_port, broker_protocol)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(&project.name)
        .bind(&project.slug)
        .bind(&project.broker_client_id)
        .bind(&project.broker_address)
        .bind(project.broker_port)
        .bind(&project.broker_protocol)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::Conflict(format!("slug {} already exists", project.slug)));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(ProjectRow {
            id,
            name: project.name,
            slug: project.slug,
            broker_client_id: project.broker_client_id,
            broker_address: project.broker_address,
            broker_port: project.broker_port,
            broker_protocol: project.broker_protocol,
        })
    }

    async fn list_sections(&self, project_id: Uuid) -> Result<Vec<SectionRow>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, String)>(
            "SELECT id, project_id, name
             FROM project_sections
             WHERE project_id = $1
             ORDER BY created_at, id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, project_id, name)| SectionRow { id, project_id, name })
            .collect())
    }

    async fn section(&self, section_id: Uuid) -> Result<Option<SectionRow>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid, Uuid, String)>(
            "SELECT id, project_id, name FROM project_sections WHERE id = $1",
        )
        .bind(section_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, project_id, name)| SectionRow { id, project_id, name }))
    }

    async fn create_section(&self, project_id: Uuid, name: &str) -> Result<SectionRow, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO project_sections (id, project_id, name) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(project_id)
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(SectionRow { id, project_id, name: name.to_owned() })
    }

    async fn rename_section(&self, section_id: Uuid, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE project_sections SET name = $2 WHERE id = $1")
            .bind(section_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_section(&self, section_id: Uuid) -> Result<bool, StoreError> {
        // Widgets go first explicitly; the FK cascade covers older schemas too.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM project_widgets WHERE section_id = $1")
            .bind(section_id)
            .execute(tx.as_mut())
            .await?;
        let result = sqlx::query("DELETE FROM project_sections WHERE id = $1")
            .bind(section_id)
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_widgets(&self, section_id: Uuid) -> Result<Vec<WidgetRow>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, String, String, Option<Vec<u8>>)>(
            "SELECT id, section_id, title, kind, config
             FROM project_widgets
             WHERE section_id = $1
             ORDER BY created_at, id",
        )
        .bind(section_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(widget_from_tuple).collect())
    }

    async fn widget(&self, widget_id: Uuid) -> Result<Option<WidgetRow>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid, Uuid, String, String, Option<Vec<u8>>)>(
            "SELECT id, section_id, title, kind, config FROM project_widgets WHERE id = $1",
        )
        .bind(widget_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(widget_from_tuple))
    }

    async fn create_widget(&self, widget: NewWidget) -> Result<WidgetRow, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO project_widgets (id, section_id, title, kind, config) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(widget.section_id)
        .bind(&widget.title)
        .bind(&widget.kind)
        .bind(&widget.config)
        .execute(&self.pool)
        .await?;

        Ok(WidgetRow {
            id,
            section_id: widget.section_id,
            title: widget.title,
            kind: widget.kind,
            config: Some(widget.config),
        })
    }

    async fn update_widget(&self, widget_id: Uuid, title: &str, config: &[u8]) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE project_widgets SET title = $2, config = $3 WHERE id = $1")
            .bind(widget_id)
            .bind(title)
            .bind(config)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_widget(&self, widget_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM project_widgets WHERE id = $1")
            .bind(widget_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_data_log(&self, topic: &str, payload: &[u8], at: OffsetDateTime) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO data_logs (topic, payload, created_at) VALUES ($1, $2, $3)")
            .bind(topic)
            .bind(payload)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent_data_logs(&self, topic: &str, limit: i64) -> Result<Vec<DataLogRow>, StoreError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, (i64, String, Vec<u8>, OffsetDateTime)>(
            "SELECT id, topic, payload, created_at
             FROM data_logs
             WHERE topic = $1
             ORDER BY id DESC
             LIMIT $2",
        )
        .bind(topic)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, topic, payload, created_at)| DataLogRow { id, topic, payload, created_at })
            .collect())
    }
}

#[cfg(all(test, feature = "live-db-tests"))]
#[path = "postgres_test.rs"]
mod tests;
