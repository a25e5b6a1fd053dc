//! Connection service: connect, disconnect and status for a project.
//!
//! DESIGN
//! ======
//! Handlers never wait on the broker. Connect plans subscriptions from the
//! project's current widgets and hands them to the session's background
//! connect task; disconnect runs on its own task. Widget edits made while
//! online take effect on the next connect.

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::dashboard::{self, DashboardError};
use crate::broker::{BrokerEndpoint, ConnectionStatus};
use crate::state::AppState;
use crate::widgets::plan_topics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The session was already online; nothing was started.
    AlreadyOnline,
    /// A background connect is already running for this project.
    AlreadyConnecting,
    /// A background connect has been started.
    Started,
}

/// Start connecting a project's session and subscribing every widget topic.
///
/// # Errors
///
/// Returns not found for an unknown slug, a broker error for unusable stored
/// broker settings, or a store error while loading widgets.
pub async fn connect_project(state: &AppState, slug: &str) -> Result<ConnectOutcome, DashboardError> {
    let project = dashboard::project_by_slug(state.store.as_ref(), slug).await?;
    let endpoint = BrokerEndpoint::from_project(&project)?;
    let session = state.registry.get_or_create(project.id, endpoint).await;
    if session.is_online() {
        return Ok(ConnectOutcome::AlreadyOnline);
    }

    let layout = dashboard::load_layout(state.store.as_ref(), project.id).await?;
    let plan = plan_topics(layout.iter().flat_map(|section| &section.widgets));
    if !plan.skipped.is_empty() {
        warn!(project_id = %project.id, skipped = plan.skipped.len(), "some widgets will not be subscribed");
    }
    let topics = plan.subscriptions.len();

    if !session.spawn_connect(plan) {
        return Ok(ConnectOutcome::AlreadyConnecting);
    }
    info!(project_id = %project.id, broker = %session.uri(), topics, "connect started");
    Ok(ConnectOutcome::Started)
}

/// Disconnect a project's session in the background. A project without a
/// session is left alone.
///
/// # Errors
///
/// Returns not found for an unknown slug.
pub async fn disconnect_project(state: &AppState, slug: &str) -> Result<(), DashboardError> {
    let project = dashboard::project_by_slug(state.store.as_ref(), slug).await?;
    if let Some(session) = state.registry.find(project.id).await {
        tokio::spawn(async move { session.disconnect().await });
        info!(project_id = %project.id, "disconnect started");
    }
    Ok(())
}

/// Current status; a project that never connected is offline.
///
/// # Errors
///
/// Returns not found for an unknown slug.
pub async fn connection_status(state: &AppState, slug: &str) -> Result<ConnectionStatus, DashboardError> {
    let project = dashboard::project_by_slug(state.store.as_ref(), slug).await?;
    Ok(state
        .registry
        .find(project.id)
        .await
        .map_or(ConnectionStatus::Offline, |session| session.status()))
}

/// Point-in-time view of a project's session for the management API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub connecting: bool,
    pub broker: Option<String>,
    pub subscriptions: Vec<String>,
}

/// Status, in-flight connect and acknowledged subscriptions of `project_id`.
pub async fn connection_snapshot(state: &AppState, project_id: Uuid) -> ConnectionSnapshot {
    match state.registry.find(project_id).await {
        Some(session) => ConnectionSnapshot {
            status: session.status(),
            connecting: session.is_connecting(),
            broker: Some(session.uri()),
            subscriptions: session.subscribed_topics().await,
        },
        None => ConnectionSnapshot {
            status: ConnectionStatus::Offline,
            connecting: false,
            broker: None,
            subscriptions: Vec::new(),
        },
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
