//! Connection registry: at most one broker session per project.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::{BrokerConnector, BrokerEndpoint, BrokerSession};
use crate::config::BrokerConfig;
use crate::store::DashboardStore;

/// Process-wide map of project id to session. Cheap to clone; clones share
/// the same map.
#[derive(Clone)]
pub struct ConnectionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<BrokerSession>>>>,
    connector: Arc<dyn BrokerConnector>,
    store: Arc<dyn DashboardStore>,
    config: BrokerConfig,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(connector: Arc<dyn BrokerConnector>, store: Arc<dyn DashboardStore>, config: BrokerConfig) -> Self {
        Self { sessions: Arc::new(RwLock::new(HashMap::new())), connector, store, config }
    }

    pub async fn find(&self, project_id: Uuid) -> Option<Arc<BrokerSession>> {
        self.sessions.read().await.get(&project_id).cloned()
    }

    /// Return the project's session, creating an offline one if none exists.
    /// Lookup and insert happen under one write lock, so concurrent callers
    /// always share a session. An existing session keeps the endpoint it was
    /// created with.
    pub async fn get_or_create(&self, project_id: Uuid, endpoint: BrokerEndpoint) -> Arc<BrokerSession> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&project_id) {
            if existing.endpoint() != &endpoint {
                warn!(
                    %project_id,
                    current = %existing.uri(),
                    requested = %endpoint.uri(),
                    "broker settings changed; keeping existing session"
                );
            }
            return Arc::clone(existing);
        }

        let session = Arc::new(BrokerSession::new(
            project_id,
            endpoint,
            self.config,
            Arc::clone(&self.connector),
            Arc::clone(&self.store),
        ));
        sessions.insert(project_id, Arc::clone(&session));
        info!(%project_id, broker = %session.uri(), "created broker session");
        session
    }

    /// Drop the project's session from the registry without disconnecting it.
    pub async fn remove(&self, project_id: Uuid) -> Option<Arc<BrokerSession>> {
        self.sessions.write().await.remove(&project_id)
    }

    /// Disconnect and forget every session. Used on server shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<BrokerSession>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        let count = drained.len();
        for session in drained {
            session.disconnect().await;
        }
        info!(sessions = count, "broker sessions shut down");
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
