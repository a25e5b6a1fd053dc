//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the dashboard store and the connection registry; the registry in
//! turn owns every live broker session, one per project.

use std::sync::Arc;

use crate::broker::{BrokerConnector, ConnectionRegistry};
use crate::config::BrokerConfig;
use crate::store::DashboardStore;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DashboardStore>,
    pub registry: ConnectionRegistry,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn DashboardStore>, connector: Arc<dyn BrokerConnector>, broker: BrokerConfig) -> Self {
        let registry = ConnectionRegistry::new(connector, Arc::clone(&store), broker);
        Self { store, registry }
    }
}

#[cfg(test)]
pub mod test_helpers {
    use std::collections::HashSet;
    use std::future::Future;
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::broker::{BrokerEndpoint, BrokerError, BrokerLink, InboundMessage};
    use crate::store::memory::MemoryStore;
    use crate::store::{NewProject, NewWidget, ProjectRow, SectionRow, WidgetRow};
    use crate::widgets::WidgetKind;

    // =========================================================================
    // FAKE BROKER
    // =========================================================================

    #[derive(Default)]
    struct FakeInner {
        connects: usize,
        disconnects: usize,
        fail_connects: usize,
        connect_delay: Option<Duration>,
        rejected_topics: HashSet<String>,
        subscribes: Vec<String>,
        unsubscribes: Vec<String>,
        publishes: Vec<(String, Vec<u8>)>,
        inbound: Option<mpsc::Sender<InboundMessage>>,
    }

    /// Scripted broker. Records every request and lets tests push messages
    /// into the most recently opened link.
    #[derive(Default)]
    pub struct FakeBroker {
        inner: Arc<Mutex<FakeInner>>,
    }

    fn lock(inner: &Mutex<FakeInner>) -> MutexGuard<'_, FakeInner> {
        inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    impl FakeBroker {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `count` connect attempts fail.
        pub fn fail_next_connects(&self, count: usize) {
            lock(&self.inner).fail_connects = count;
        }

        pub fn set_connect_delay(&self, delay: Duration) {
            lock(&self.inner).connect_delay = Some(delay);
        }

        /// Make the broker refuse subscriptions to `topic`.
        pub fn reject_topic(&self, topic: &str) {
            lock(&self.inner).rejected_topics.insert(topic.to_owned());
        }

        #[must_use]
        pub fn connect_count(&self) -> usize {
            lock(&self.inner).connects
        }

        #[must_use]
        pub fn disconnect_count(&self) -> usize {
            lock(&self.inner).disconnects
        }

        #[must_use]
        pub fn subscribes(&self) -> Vec<String> {
            lock(&self.inner).subscribes.clone()
        }

        #[must_use]
        pub fn unsubscribes(&self) -> Vec<String> {
            lock(&self.inner).unsubscribes.clone()
        }

        #[must_use]
        pub fn publishes(&self) -> Vec<(String, Vec<u8>)> {
            lock(&self.inner).publishes.clone()
        }

        /// Deliver a message on the open link. Returns `false` when no link is open.
        pub async fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
            let sender = lock(&self.inner).inbound.clone();
            match sender {
                Some(sender) => sender
                    .send(InboundMessage { topic: topic.to_owned(), payload: payload.to_vec() })
                    .await
                    .is_ok(),
                None => false,
            }
        }

        /// Simulate the broker dropping the connection.
        pub fn drop_connection(&self) {
            lock(&self.inner).inbound = None;
        }
    }

    #[async_trait::async_trait]
    impl BrokerConnector for FakeBroker {
        async fn connect(
            &self,
            _endpoint: &BrokerEndpoint,
            inbound: mpsc::Sender<InboundMessage>,
        ) -> Result<Arc<dyn BrokerLink>, BrokerError> {
            let delay = lock(&self.inner).connect_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut inner = lock(&self.inner);
            inner.connects += 1;
            if inner.fail_connects > 0 {
                inner.fail_connects -= 1;
                return Err(BrokerError::Connection("connection refused".into()));
            }
            inner.inbound = Some(inbound);
            Ok(Arc::new(FakeLink { inner: Arc::clone(&self.inner) }))
        }
    }

    struct FakeLink {
        inner: Arc<Mutex<FakeInner>>,
    }

    #[async_trait::async_trait]
    impl BrokerLink for FakeLink {
        async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
            let mut inner = lock(&self.inner);
            if inner.rejected_topics.contains(topic) {
                return Err(BrokerError::Rejected(format!("subscription to {topic} refused")));
            }
            inner.subscribes.push(topic.to_owned());
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
            lock(&self.inner).unsubscribes.push(topic.to_owned());
            Ok(())
        }

        async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
            lock(&self.inner).publishes.push((topic.to_owned(), payload.to_vec()));
            Ok(())
        }

        async fn disconnect(&self, _grace: Duration) -> Result<(), BrokerError> {
            let mut inner = lock(&self.inner);
            inner.inbound = None;
            inner.disconnects += 1;
            Ok(())
        }
    }

    // =========================================================================
    // STATE
    // =========================================================================

    /// Broker tuning with short deadlines and a single connect attempt.
    #[must_use]
    pub fn test_broker_config() -> BrokerConfig {
        BrokerConfig {
            connect_timeout: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(500),
            disconnect_grace: Duration::from_millis(10),
            connect_retries: 1,
            retry_base: Duration::from_millis(5),
            keep_alive: Duration::from_secs(5),
            topic_buffer_capacity: 16,
            inbound_queue_capacity: 16,
        }
    }

    /// Create a test `AppState` backed by an in-memory store and a fake broker.
    #[must_use]
    pub fn test_app_state() -> (AppState, Arc<MemoryStore>, Arc<FakeBroker>) {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(FakeBroker::new());
        let state = AppState::new(store.clone(), broker.clone(), test_broker_config());
        (state, store, broker)
    }

    /// Poll `check` until it returns true or roughly one second passes.
    pub async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    // =========================================================================
    // SEEDING
    // =========================================================================

    /// Seed a project pointing at a local broker and return it.
    pub async fn seed_project(store: &MemoryStore, slug: &str) -> ProjectRow {
        store
            .create_project(NewProject {
                name: format!("Project {slug}"),
                slug: slug.to_owned(),
                broker_client_id: format!("{slug}-client"),
                broker_address: "localhost".into(),
                broker_port: 1883,
                broker_protocol: "tcp".into(),
            })
            .await
            .expect("seed project")
    }

    pub async fn seed_section(store: &MemoryStore, project_id: Uuid, name: &str) -> SectionRow {
        store
            .create_section(project_id, name)
            .await
            .expect("seed section")
    }

    /// Seed a widget whose config blob is `config` serialized as JSON.
    pub async fn seed_widget(
        store: &MemoryStore,
        section_id: Uuid,
        kind: WidgetKind,
        config: serde_json::Value,
    ) -> WidgetRow {
        store
            .create_widget(NewWidget {
                section_id,
                title: format!("{kind} widget"),
                kind: kind.as_str().to_owned(),
                config: serde_json::to_vec(&config).expect("encode config"),
            })
            .await
            .expect("seed widget")
    }
}
