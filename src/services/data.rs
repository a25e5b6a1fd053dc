//! Data assembly: per-widget display values and button publishes.
//!
//! DESIGN
//! ======
//! Values are read, never awaited: text and indicator widgets show the most
//! recent buffered payload for their topic, time-series widgets replay the
//! last `max_length` data log rows in chronological order, buttons carry no
//! data. A widget whose config no longer decodes renders as `null` without
//! affecting the rest of the response.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dashboard::{self, DashboardError};
use crate::broker::BrokerSession;
use crate::state::AppState;
use crate::store::{DashboardStore, StoreError};
use crate::widgets::{self, TimeseriesConfig, WidgetConfig};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WidgetData {
    pub id: Uuid,
    pub data: Option<WidgetPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum WidgetPayload {
    Text(String),
    Timeseries(TimeseriesData),
}

/// Chart payload: one `HH:MM:SS` label per point and one dataset keyed by the
/// widget's label, both oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeseriesData {
    pub timestamps: Vec<String>,
    pub series: BTreeMap<String, Vec<String>>,
}

/// A validated button press, ready to publish.
pub struct PendingPublish {
    session: Arc<BrokerSession>,
    widget_id: Uuid,
    topic: String,
    payload: Vec<u8>,
}

impl PendingPublish {
    /// Publish once. Failures are logged; the session state is unchanged.
    pub async fn send(self) {
        match self.session.publish(&self.topic, &self.payload).await {
            Ok(()) => debug!(widget_id = %self.widget_id, topic = %self.topic, "button value submitted"),
            Err(e) => warn!(widget_id = %self.widget_id, topic = %self.topic, error = %e, "button publish failed"),
        }
    }
}

// =============================================================================
// ASSEMBLY
// =============================================================================

fn time_label(at: OffsetDateTime) -> String {
    let at = at.to_offset(UtcOffset::UTC);
    format!("{:02}:{:02}:{:02}", at.hour(), at.minute(), at.second())
}

/// Build a time-series payload from the data log.
///
/// # Errors
///
/// Returns a store error if the data log query fails.
pub async fn timeseries(store: &dyn DashboardStore, config: &TimeseriesConfig) -> Result<TimeseriesData, StoreError> {
    let limit = i64::try_from(config.max_length).unwrap_or(i64::MAX);
    let mut rows = store.recent_data_logs(&config.topic, limit).await?;
    rows.reverse();

    let mut data = TimeseriesData::default();
    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        data.timestamps.push(time_label(row.created_at));
        values.push(String::from_utf8_lossy(&row.payload).into_owned());
    }
    data.series.insert(config.label.clone(), values);
    Ok(data)
}

async fn widget_payload(
    store: &dyn DashboardStore,
    session: &BrokerSession,
    config: &WidgetConfig,
) -> Result<Option<WidgetPayload>, StoreError> {
    Ok(match config {
        WidgetConfig::Text(c) => session.latest_text(&c.topic).map(WidgetPayload::Text),
        WidgetConfig::Indicator(c) => session.latest_text(&c.topic).map(WidgetPayload::Text),
        WidgetConfig::Button(_) => None,
        WidgetConfig::TimeseriesLineChart(c) => Some(WidgetPayload::Timeseries(timeseries(store, c).await?)),
    })
}

/// Assemble the data response for every widget of a project, in section then
/// widget order. Returns `None` when the project has no session yet.
///
/// # Errors
///
/// Returns not found for an unknown slug and store errors from any query.
pub async fn assemble(state: &AppState, slug: &str) -> Result<Option<Vec<WidgetData>>, DashboardError> {
    let store = state.store.as_ref();
    let project = dashboard::project_by_slug(store, slug).await?;
    let Some(session) = state.registry.find(project.id).await else {
        return Ok(None);
    };

    let layout = dashboard::load_layout(store, project.id).await?;
    let mut out = Vec::new();
    for row in layout.iter().flat_map(|section| &section.widgets) {
        let data = match widgets::resolve(row) {
            Ok(config) => widget_payload(store, &session, &config).await?,
            Err(e) => {
                warn!(widget_id = %row.id, kind = %row.kind, error = %e, "rendering widget without data");
                None
            }
        };
        out.push(WidgetData { id: row.id, data });
    }
    Ok(Some(out))
}

// =============================================================================
// SUBMIT
// =============================================================================

/// Validate a button press for `widget_id`. The caller decides when to send.
///
/// # Errors
///
/// Returns not found for an unknown slug or foreign widget, invalid input for
/// a widget that is not a button, and [`DashboardError::Offline`] when the
/// project has no online session.
pub async fn submit_value(state: &AppState, slug: &str, widget_id: Uuid) -> Result<PendingPublish, DashboardError> {
    let store = state.store.as_ref();
    let project = dashboard::project_by_slug(store, slug).await?;
    let row = dashboard::owned_widget(store, &project, widget_id).await?;
    let WidgetConfig::Button(button) = widgets::resolve(&row)? else {
        return Err(DashboardError::InvalidInput(format!("widget {widget_id} is not a button")));
    };

    let session = state
        .registry
        .find(project.id)
        .await
        .filter(|session| session.is_online())
        .ok_or(DashboardError::Offline)?;

    info!(project_id = %project.id, %widget_id, topic = %button.topic, "button pressed");
    Ok(PendingPublish { session, widget_id, topic: button.topic, payload: button.message.into_bytes() })
}

#[cfg(test)]
#[path = "data_test.rs"]
mod tests;
