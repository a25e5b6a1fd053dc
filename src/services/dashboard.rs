//! Dashboard service: projects, sections and widgets.
//!
//! DESIGN
//! ======
//! Every section or widget is addressed under its project's slug; an id that
//! belongs to another project is treated as not found. Widget input is
//! validated per kind before anything is written, so the store only ever
//! receives configs that decode.
//!
//! ERROR HANDLING
//! ==============
//! This is the fail-fast edit path: a stored config that no longer decodes is
//! reported to the caller here, while subscription planning and data assembly
//! skip such widgets instead.

use tracing::info;
use uuid::Uuid;

use crate::broker::{BrokerError, DEFAULT_BROKER_PROTOCOL};
use crate::store::{DashboardStore, NewProject, NewWidget, ProjectRow, SectionRow, StoreError, WidgetRow};
use crate::widgets::{
    self, ButtonConfig, ConfigDecodeError, DEFAULT_INDICATOR_COLOR, DEFAULT_TIMESERIES_MAX_LENGTH, IndicatorConfig,
    TextConfig, TimeseriesConfig, WidgetConfig, WidgetKind,
};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("section not found: {0}")]
    SectionNotFound(Uuid),
    #[error("widget not found: {0}")]
    WidgetNotFound(Uuid),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("project is offline")]
    Offline,
    #[error(transparent)]
    Config(#[from] ConfigDecodeError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One section with its widgets, in creation order.
#[derive(Debug, Clone)]
pub struct SectionLayout {
    pub section: SectionRow,
    pub widgets: Vec<WidgetRow>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ProjectInput {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub broker_client_id: String,
    pub broker_address: String,
    pub broker_port: i32,
    #[serde(default)]
    pub broker_protocol: String,
}

/// Kind-specific widget fields as submitted by a client. Absent fields fall
/// back to the widget's current values on update.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct WidgetFields {
    pub topic: Option<String>,
    pub message: Option<String>,
    pub on_condition: Option<String>,
    pub color: Option<String>,
    pub label: Option<String>,
    pub max_length: Option<usize>,
}

impl WidgetFields {
    fn from_config(config: &WidgetConfig) -> Self {
        match config {
            WidgetConfig::Text(c) => Self { topic: Some(c.topic.clone()), ..Self::default() },
            WidgetConfig::Button(c) => {
                Self { topic: Some(c.topic.clone()), message: Some(c.message.clone()), ..Self::default() }
            }
            WidgetConfig::Indicator(c) => Self {
                topic: Some(c.topic.clone()),
                on_condition: Some(c.on_condition.clone()),
                color: Some(c.color.clone()),
                ..Self::default()
            },
            WidgetConfig::TimeseriesLineChart(c) => Self {
                topic: Some(c.topic.clone()),
                label: Some(c.label.clone()),
                max_length: Some(c.max_length),
                ..Self::default()
            },
        }
    }

    fn merged_over(self, current: Option<&WidgetConfig>) -> Self {
        let Some(current) = current else {
            return self;
        };
        let base = Self::from_config(current);
        Self {
            topic: self.topic.or(base.topic),
            message: self.message.or(base.message),
            on_condition: self.on_condition.or(base.on_condition),
            color: self.color.or(base.color),
            label: self.label.or(base.label),
            max_length: self.max_length.or(base.max_length),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewWidgetInput {
    pub section_id: Uuid,
    pub title: String,
    pub kind: String,
    #[serde(flatten)]
    pub fields: WidgetFields,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct WidgetUpdate {
    pub title: Option<String>,
    #[serde(flatten)]
    pub fields: WidgetFields,
}

// =============================================================================
// VALIDATION
// =============================================================================

fn required(value: Option<String>, kind: WidgetKind, field: &str) -> Result<String, DashboardError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_owned()),
        _ => Err(DashboardError::InvalidInput(format!("{kind} widget requires {field}"))),
    }
}

fn non_blank(value: &str, field: &str) -> Result<String, DashboardError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DashboardError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_owned())
}

/// Build a validated config for `kind` from submitted fields.
///
/// # Errors
///
/// Returns [`DashboardError::InvalidInput`] naming the first missing field.
pub fn build_config(kind: WidgetKind, fields: WidgetFields) -> Result<WidgetConfig, DashboardError> {
    Ok(match kind {
        WidgetKind::Text => WidgetConfig::Text(TextConfig { topic: required(fields.topic, kind, "topic")? }),
        WidgetKind::Button => WidgetConfig::Button(ButtonConfig {
            topic: required(fields.topic, kind, "topic")?,
            message: required(fields.message, kind, "message")?,
        }),
        WidgetKind::Indicator => WidgetConfig::Indicator(IndicatorConfig {
            topic: required(fields.topic, kind, "topic")?,
            on_condition: required(fields.on_condition, kind, "on_condition")?,
            color: fields
                .color
                .map(|c| c.trim().to_owned())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| DEFAULT_INDICATOR_COLOR.to_owned()),
        }),
        WidgetKind::TimeseriesLineChart => {
            let max_length = fields.max_length.unwrap_or(DEFAULT_TIMESERIES_MAX_LENGTH);
            if max_length == 0 {
                return Err(DashboardError::InvalidInput("max_length must be at least 1".into()));
            }
            WidgetConfig::TimeseriesLineChart(TimeseriesConfig {
                topic: required(fields.topic, kind, "topic")?,
                label: required(fields.label, kind, "label")?,
                max_length,
            })
        }
    })
}

fn validate_slug(slug: &str) -> Result<String, DashboardError> {
    let slug = non_blank(slug, "slug")?;
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(DashboardError::InvalidInput(format!(
            "slug may only contain lowercase letters, digits, '-' and '_': {slug}"
        )));
    }
    Ok(slug)
}

fn encode(config: &WidgetConfig) -> Result<Vec<u8>, DashboardError> {
    config
        .encode()
        .map_err(|e| DashboardError::InvalidInput(format!("config could not be encoded: {e}")))
}

// =============================================================================
// PROJECTS
// =============================================================================

/// # Errors
///
/// Returns a store error if the query fails.
pub async fn list_projects(store: &dyn DashboardStore) -> Result<Vec<ProjectRow>, DashboardError> {
    Ok(store.list_projects().await?)
}

/// Look up a project by slug.
///
/// # Errors
///
/// Returns [`DashboardError::ProjectNotFound`] for an unknown slug.
pub async fn project_by_slug(store: &dyn DashboardStore, slug: &str) -> Result<ProjectRow, DashboardError> {
    store
        .project_by_slug(slug)
        .await?
        .ok_or_else(|| DashboardError::ProjectNotFound(slug.to_owned()))
}

/// Create a project after validating its identity and broker settings.
///
/// # Errors
///
/// Returns [`DashboardError::InvalidInput`] for bad fields and a store
/// conflict if the slug is taken.
pub async fn create_project(store: &dyn DashboardStore, input: ProjectInput) -> Result<ProjectRow, DashboardError> {
    let protocol = match input.broker_protocol.trim() {
        "" => DEFAULT_BROKER_PROTOCOL.to_owned(),
        other => other.to_ascii_lowercase(),
    };
    if !(1..=i32::from(u16::MAX)).contains(&input.broker_port) {
        return Err(DashboardError::InvalidInput(format!("broker_port out of range: {}", input.broker_port)));
    }

    let project = store
        .create_project(NewProject {
            name: non_blank(&input.name, "name")?,
            slug: validate_slug(&input.slug)?,
            broker_client_id: input.broker_client_id.trim().to_owned(),
            broker_address: non_blank(&input.broker_address, "broker_address")?,
            broker_port: input.broker_port,
            broker_protocol: protocol,
        })
        .await?;

    info!(project_id = %project.id, slug = %project.slug, "project created");
    Ok(project)
}

/// All sections of a project with their widgets.
///
/// # Errors
///
/// Returns a store error if any query fails.
pub async fn load_layout(store: &dyn DashboardStore, project_id: Uuid) -> Result<Vec<SectionLayout>, StoreError> {
    let sections = store.list_sections(project_id).await?;
    let mut layout = Vec::with_capacity(sections.len());
    for section in sections {
        let widgets = store.list_widgets(section.id).await?;
        layout.push(SectionLayout { section, widgets });
    }
    Ok(layout)
}

// =============================================================================
// SECTIONS
// =============================================================================

async fn owned_section(
    store: &dyn DashboardStore,
    project: &ProjectRow,
    section_id: Uuid,
) -> Result<SectionRow, DashboardError> {
    store
        .section(section_id)
        .await?
        .filter(|section| section.project_id == project.id)
        .ok_or(DashboardError::SectionNotFound(section_id))
}

/// # Errors
///
/// Returns not found for an unknown slug and invalid input for a blank name.
pub async fn create_section(store: &dyn DashboardStore, slug: &str, name: &str) -> Result<SectionRow, DashboardError> {
    let project = project_by_slug(store, slug).await?;
    let section = store.create_section(project.id, &non_blank(name, "name")?).await?;
    info!(project_id = %project.id, section_id = %section.id, "section created");
    Ok(section)
}

/// # Errors
///
/// Returns not found when the section is missing or belongs to another project.
pub async fn rename_section(
    store: &dyn DashboardStore,
    slug: &str,
    section_id: Uuid,
    name: &str,
) -> Result<(), DashboardError> {
    let project = project_by_slug(store, slug).await?;
    owned_section(store, &project, section_id).await?;
    if !store.rename_section(section_id, &non_blank(name, "name")?).await? {
        return Err(DashboardError::SectionNotFound(section_id));
    }
    Ok(())
}

/// Delete a section and all of its widgets. Live subscriptions are left
/// untouched until the project reconnects.
///
/// # Errors
///
/// Returns not found when the section is missing or belongs to another project.
pub async fn delete_section(store: &dyn DashboardStore, slug: &str, section_id: Uuid) -> Result<(), DashboardError> {
    let project = project_by_slug(store, slug).await?;
    owned_section(store, &project, section_id).await?;
    if !store.delete_section(section_id).await? {
        return Err(DashboardError::SectionNotFound(section_id));
    }
    info!(project_id = %project.id, %section_id, "section deleted");
    Ok(())
}

// =============================================================================
// WIDGETS
// =============================================================================

/// Fetch a widget, requiring it to live in one of `project`'s sections.
///
/// # Errors
///
/// Returns [`DashboardError::WidgetNotFound`] otherwise.
pub async fn owned_widget(
    store: &dyn DashboardStore,
    project: &ProjectRow,
    widget_id: Uuid,
) -> Result<WidgetRow, DashboardError> {
    let widget = store
        .widget(widget_id)
        .await?
        .ok_or(DashboardError::WidgetNotFound(widget_id))?;
    match store.section(widget.section_id).await? {
        Some(section) if section.project_id == project.id => Ok(widget),
        _ => Err(DashboardError::WidgetNotFound(widget_id)),
    }
}

/// Validate and create a widget in one of the project's sections.
///
/// # Errors
///
/// Returns invalid input for an unknown kind, a blank title or missing
/// kind-specific fields; not found for a foreign section.
pub async fn create_widget(
    store: &dyn DashboardStore,
    slug: &str,
    input: NewWidgetInput,
) -> Result<WidgetRow, DashboardError> {
    let project = project_by_slug(store, slug).await?;
    let kind = WidgetKind::parse(input.kind.trim())
        .ok_or_else(|| DashboardError::InvalidInput(format!("unknown widget kind: {}", input.kind)))?;
    let title = non_blank(&input.title, "title")?;
    let config = build_config(kind, input.fields)?;
    owned_section(store, &project, input.section_id).await?;

    let widget = store
        .create_widget(NewWidget {
            section_id: input.section_id,
            title,
            kind: kind.as_str().to_owned(),
            config: encode(&config)?,
        })
        .await?;
    info!(project_id = %project.id, widget_id = %widget.id, %kind, "widget created");
    Ok(widget)
}

/// Update a widget's title and kind-specific fields. The kind never changes.
/// Edits reach the broker on the project's next connect.
///
/// # Errors
///
/// Returns not found for a foreign widget and invalid input when the merged
/// fields fail validation.
pub async fn update_widget(
    store: &dyn DashboardStore,
    slug: &str,
    widget_id: Uuid,
    update: WidgetUpdate,
) -> Result<WidgetRow, DashboardError> {
    let project = project_by_slug(store, slug).await?;
    let row = owned_widget(store, &project, widget_id).await?;
    let kind = WidgetKind::parse(&row.kind).ok_or_else(|| ConfigDecodeError::UnknownKind(row.kind.clone()))?;

    let current = widgets::resolve(&row).ok();
    let config = build_config(kind, update.fields.merged_over(current.as_ref()))?;
    let title = match update.title {
        Some(title) => non_blank(&title, "title")?,
        None => row.title.clone(),
    };
    let blob = encode(&config)?;

    if !store.update_widget(widget_id, &title, &blob).await? {
        return Err(DashboardError::WidgetNotFound(widget_id));
    }
    info!(project_id = %project.id, %widget_id, "widget updated");
    Ok(WidgetRow { title, config: Some(blob), ..row })
}

/// # Errors
///
/// Returns not found for a missing or foreign widget.
pub async fn delete_widget(store: &dyn DashboardStore, slug: &str, widget_id: Uuid) -> Result<(), DashboardError> {
    let project = project_by_slug(store, slug).await?;
    owned_widget(store, &project, widget_id).await?;
    if !store.delete_widget(widget_id).await? {
        return Err(DashboardError::WidgetNotFound(widget_id));
    }
    info!(project_id = %project.id, %widget_id, "widget deleted");
    Ok(())
}

#[cfg(test)]
#[path = "dashboard_test.rs"]
mod tests;
