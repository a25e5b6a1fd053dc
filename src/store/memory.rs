//! In-memory [`DashboardStore`] for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use super::{DashboardStore, DataLogRow, NewProject, NewWidget, ProjectRow, SectionRow, StoreError, WidgetRow};

#[derive(Default)]
struct MemoryInner {
    projects: Vec<ProjectRow>,
    sections: Vec<SectionRow>,
    widgets: Vec<WidgetRow>,
    data_logs: Vec<DataLogRow>,
    next_log_id: i64,
}

/// Vec-backed store. Rows keep insertion order, which doubles as creation order.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    failing: AtomicBool,
    append_delay: Mutex<Duration>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a pool timeout until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Hold every data log append for `delay` before writing it.
    pub fn set_append_delay(&self, delay: Duration) {
        *self.append_delay.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = delay;
    }

    /// Insert a widget row verbatim, including a missing config blob.
    pub fn insert_raw_widget(&self, section_id: Uuid, kind: &str, config: Option<&[u8]>) -> WidgetRow {
        let row = WidgetRow {
            id: Uuid::new_v4(),
            section_id,
            title: format!("{kind} widget"),
            kind: kind.to_owned(),
            config: config.map(<[u8]>::to_vec),
        };
        self.lock().widgets.push(row.clone());
        row
    }

    /// Insert a data log row with an explicit timestamp.
    pub fn insert_data_log(&self, topic: &str, payload: &[u8], at: OffsetDateTime) {
        let mut inner = self.lock();
        inner.next_log_id += 1;
        let id = inner.next_log_id;
        inner.data_logs.push(DataLogRow { id, topic: topic.to_owned(), payload: payload.to_vec(), created_at: at });
    }

    /// Number of data log rows written for `topic`.
    pub fn data_log_count(&self, topic: &str) -> usize {
        self.lock().data_logs.iter().filter(|row| row.topic == topic).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DashboardStore for MemoryStore {
    async fn list_projects(&self) -> Result<Vec<ProjectRow>, StoreError> {
        self.check()?;
        Ok(self.lock().projects.clone())
    }

    async fn project_by_slug(&self, slug: &str) -> Result<Option<ProjectRow>, StoreError> {
        self.check()?;
        Ok(self.lock().projects.iter().find(|p| p.slug == slug).cloned())
    }

    async fn create_project(&self, project: NewProject) -> Result<ProjectRow, StoreError> {
        self.check()?;
        let mut inner = self.lock();
        if inner.projects.iter().any(|p| p.slug == project.slug) {
            return Err(StoreError::Conflict(format!("slug {} already exists", project.slug)));
        }
        let row = ProjectRow {
            id: Uuid::new_v4(),
            name: project.name,
            slug: project.slug,
            broker_client_id: project.broker_client_id,
            broker_address: project.broker_address,
            broker_port: project.broker_port,
            broker_protocol: project.broker_protocol,
        };
        inner.projects.push(row.clone());
        Ok(row)
    }

    async fn list_sections(&self, project_id: Uuid) -> Result<Vec<SectionRow>, StoreError> {
        self.check()?;
        Ok(self
            .lock()
            .sections
            .iter()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn section(&self, section_id: Uuid) -> Result<Option<SectionRow>, StoreError> {
        self.check()?;
        Ok(self.lock().sections.iter().find(|s| s.id == section_id).cloned())
    }

    async fn create_section(&self, project_id: Uuid, name: &str) -> Result<SectionRow, StoreError> {
        self.check()?;
        let row = SectionRow { id: Uuid::new_v4(), project_id, name: name.to_owned() };
        self.lock().sections.push(row.clone());
        Ok(row)
    }

    async fn rename_section(&self, section_id: Uuid, name: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut inner = self.lock();
        let Some(section) = inner.sections.iter_mut().find(|s| s.id == section_id) else {
            return Ok(false);
        };
        name.clone_into(&mut section.name);
        Ok(true)
    }

    async fn delete_section(&self, section_id: Uuid) -> Result<bool, StoreError> {
        self.check()?;
        let mut inner = self.lock();
        let before = inner.sections.len();
        inner.sections.retain(|s| s.id != section_id);
        inner.widgets.retain(|w| w.section_id != section_id);
        Ok(inner.sections.len() < before)
    }

    async fn list_widgets(&self, section_id: Uuid) -> Result<Vec<WidgetRow>, StoreError> {
        self.check()?;
        Ok(self
            .lock()
            .widgets
            .iter()
            .filter(|w| w.section_id == section_id)
            .cloned()
            .collect())
    }

    async fn widget(&self, widget_id: Uuid) -> Result<Option<WidgetRow>, StoreError> {
        self.check()?;
        Ok(self.lock().widgets.iter().find(|w| w.id == widget_id).cloned())
    }

    async fn create_widget(&self, widget: NewWidget) -> Result<WidgetRow, StoreError> {
        self.check()?;
        let row = WidgetRow {
            id: Uuid::new_v4(),
            section_id: widget.section_id,
            title: widget.title,
            kind: widget.kind,
            config: Some(widget.config),
        };
        self.lock().widgets.push(row.clone());
        Ok(row)
    }

    async fn update_widget(&self, widget_id: Uuid, title: &str, config: &[u8]) -> Result<bool, StoreError> {
        self.check()?;
        let mut inner = self.lock();
        let Some(widget) = inner.widgets.iter_mut().find(|w| w.id == widget_id) else {
            return Ok(false);
        };
        title.clone_into(&mut widget.title);
        widget.config = Some(config.to_vec());
        Ok(true)
    }

    async fn delete_widget(&self, widget_id: Uuid) -> Result<bool, StoreError> {
        self.check()?;
        let mut inner = self.lock();
        let before = inner.widgets.len();
        inner.widgets.retain(|w| w.id != widget_id);
        Ok(inner.widgets.len() < before)
    }

    async fn append_data_log(&self, topic: &str, payload: &[u8], at: OffsetDateTime) -> Result<(), StoreError> {
        let delay = *self.append_delay.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        self.insert_data_log(topic, payload, at);
        Ok(())
    }

    async fn recent_data_logs(&self, topic: &str, limit: i64) -> Result<Vec<DataLogRow>, StoreError> {
        self.check()?;
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut rows: Vec<DataLogRow> = self
            .lock()
            .data_logs
            .iter()
            .filter(|row| row.topic == topic)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(limit);
        Ok(rows)
    }
}
