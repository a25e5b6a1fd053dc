//! Broker session: one project's live broker connection and topic buffers.
//!
//! DESIGN
//! ======
//! A session outlives its links: it is created once per project, then
//! connected and disconnected any number of times. Each successful connect
//! spawns a pump task that drains the link's inbound channel into per-topic
//! ring buffers, and a writer task that appends rows for recorded topics to
//! the data log so a slow store never holds up the transport.
//!
//! LOCKING
//! =======
//! - `lifecycle` serializes connect, disconnect and link-loss handling.
//! - `topics` is held across a subscribe/unsubscribe round trip so the set
//!   only ever reflects acknowledged subscriptions.
//! - Buffers sit behind their own mutexes; the buffer map lock is held only
//!   long enough to find or insert a buffer.
//!
//! No std lock guard is ever held across an `.await`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock as StdRwLock};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::buffer::TopicBuffer;
use super::{BrokerConnector, BrokerEndpoint, BrokerError, BrokerLink, InboundMessage};
use crate::config::BrokerConfig;
use crate::store::{DashboardStore, StoreError};
use crate::widgets::TopicPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Offline,
    Online,
}

impl ConnectionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message on a recorded topic, stamped when it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLogEntry {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: OffsetDateTime,
}

impl DataLogEntry {
    /// Append this row to the data log.
    ///
    /// # Errors
    ///
    /// Returns the store error if the insert fails.
    pub async fn write(&self, store: &dyn DashboardStore) -> Result<(), StoreError> {
        store.append_data_log(&self.topic, &self.payload, self.received_at).await
    }
}

/// Append queued rows in arrival order until the pump drops its sender.
async fn write_data_log(store: Arc<dyn DashboardStore>, project_id: Uuid, mut rx: mpsc::Receiver<DataLogEntry>) {
    while let Some(entry) = rx.recv().await {
        if let Err(e) = entry.write(store.as_ref()).await {
            error!(%project_id, topic = %entry.topic, error = %e, "data log append failed");
        }
    }
}

pub struct BrokerSession {
    project_id: Uuid,
    endpoint: BrokerEndpoint,
    config: BrokerConfig,
    connector: Arc<dyn BrokerConnector>,
    store: Arc<dyn DashboardStore>,
    status: StdRwLock<ConnectionStatus>,
    link: StdMutex<Option<Arc<dyn BrokerLink>>>,
    /// Bumped whenever the link is replaced or dropped, so a pump left over
    /// from an older link cannot mark the current one offline.
    epoch: AtomicU64,
    lifecycle: Mutex<()>,
    topics: Mutex<BTreeSet<String>>,
    recorded: StdRwLock<HashSet<String>>,
    buffers: StdRwLock<HashMap<String, Arc<StdMutex<TopicBuffer>>>>,
    connect_task: StdMutex<Option<JoinHandle<()>>>,
}

impl BrokerSession {
    #[must_use]
    pub fn new(
        project_id: Uuid,
        endpoint: BrokerEndpoint,
        config: BrokerConfig,
        connector: Arc<dyn BrokerConnector>,
        store: Arc<dyn DashboardStore>,
    ) -> Self {
        Self {
            project_id,
            endpoint,
            config,
            connector,
            store,
            status: StdRwLock::new(ConnectionStatus::Offline),
            link: StdMutex::new(None),
            epoch: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
            topics: Mutex::new(BTreeSet::new()),
            recorded: StdRwLock::new(HashSet::new()),
            buffers: StdRwLock::new(HashMap::new()),
            connect_task: StdMutex::new(None),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn uri(&self) -> String {
        self.endpoint.uri()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status() == ConnectionStatus::Online
    }

    /// Whether a background connect started by [`Self::spawn_connect`] is still running.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        lock(&self.connect_task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn current_link(&self) -> Option<Arc<dyn BrokerLink>> {
        lock(&self.link).clone()
    }

    // =========================================================================
    // CONNECT / DISCONNECT
    // =========================================================================

    /// Open the broker link and wait for the handshake. A no-op when already
    /// online. Subscriptions start empty on every fresh link.
    ///
    /// # Errors
    ///
    /// Returns the transport error, or [`BrokerError::Timeout`] if the
    /// handshake exceeds the configured deadline. The session stays offline.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BrokerError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_online() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(self.config.inbound_queue_capacity);
        let link = match timeout(self.config.connect_timeout, self.connector.connect(&self.endpoint, tx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BrokerError::Timeout { op: "connect", ms: self.config.connect_timeout.as_millis() });
            }
        };

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.topics.lock().await.clear();
        *lock(&self.link) = Some(link);
        self.set_status(ConnectionStatus::Online);
        let (log_tx, log_rx) = mpsc::channel(self.config.inbound_queue_capacity);
        tokio::spawn(write_data_log(Arc::clone(&self.store), self.project_id, log_rx));
        tokio::spawn(Self::pump_inbound(Arc::clone(self), rx, log_tx, epoch));

        info!(project_id = %self.project_id, broker = %self.uri(), client_id = %self.endpoint.client_id, "connected to broker");
        Ok(())
    }

    /// [`Self::connect`] with exponential back-off between attempts.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, or immediately for
    /// errors that cannot succeed on retry.
    pub async fn connect_with_retry(self: &Arc<Self>) -> Result<(), BrokerError> {
        let attempts = self.config.connect_retries.max(1);
        let mut delay = self.config.retry_base;
        let mut attempt = 1;
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts && e.retryable() => {
                    warn!(
                        project_id = %self.project_id,
                        error = %e,
                        attempt,
                        total = attempts,
                        "broker connect failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Connect and subscribe to every topic in `plan` on a supervised
    /// background task. Returns `false` if a connect is already in flight.
    pub fn spawn_connect(self: &Arc<Self>, plan: TopicPlan) -> bool {
        let mut slot = lock(&self.connect_task);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }
        let session = Arc::clone(self);
        *slot = Some(tokio::spawn(session.connect_and_subscribe(plan)));
        true
    }

    async fn connect_and_subscribe(self: Arc<Self>, plan: TopicPlan) {
        if let Err(e) = self.connect_with_retry().await {
            warn!(project_id = %self.project_id, broker = %self.uri(), error = %e, "giving up on broker connect");
            return;
        }

        self.set_recorded_topics(plan.recorded);
        for topic in &plan.subscriptions {
            // Failures are logged inside `subscribe`; siblings still proceed.
            let _ = self.subscribe(topic).await;
        }
    }

    fn abort_pending_connect(&self) {
        if let Some(task) = lock(&self.connect_task).take() {
            if !task.is_finished() {
                task.abort();
                debug!(project_id = %self.project_id, "cancelled in-flight connect");
            }
        }
    }

    /// Close the link (bounded by the disconnect grace period), go offline and
    /// forget all subscriptions. Cancels any background connect in flight.
    pub async fn disconnect(&self) {
        self.abort_pending_connect();

        let _lifecycle = self.lifecycle.lock().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let link = lock(&self.link).take();
        self.topics.lock().await.clear();
        self.set_status(ConnectionStatus::Offline);

        if let Some(link) = link {
            if let Err(e) = link.disconnect(self.config.disconnect_grace).await {
                warn!(project_id = %self.project_id, error = %e, "broker disconnect was not clean");
            }
            info!(project_id = %self.project_id, broker = %self.uri(), "disconnected from broker");
        }
    }

    async fn connection_lost(&self, epoch: u64) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.link).take();
        self.topics.lock().await.clear();
        self.set_status(ConnectionStatus::Offline);
        warn!(project_id = %self.project_id, broker = %self.uri(), "broker connection lost");
    }

    // =========================================================================
    // SUBSCRIPTIONS / PUBLISH
    // =========================================================================

    async fn with_ack_timeout<F>(&self, op: &'static str, request: F) -> Result<(), BrokerError>
    where
        F: Future<Output = Result<(), BrokerError>>,
    {
        match timeout(self.config.ack_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout { op, ms: self.config.ack_timeout.as_millis() }),
        }
    }

    /// Subscribe to `topic` unless already subscribed. The topic is tracked
    /// only after the broker acknowledges it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] when offline, or the broker/timeout error.
    pub async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let mut topics = self.topics.lock().await;
        if topics.contains(topic) {
            return Ok(());
        }
        let link = self.current_link().ok_or(BrokerError::NotConnected)?;

        match self.with_ack_timeout("subscribe", link.subscribe(topic)).await {
            Ok(()) => {
                topics.insert(topic.to_owned());
                info!(project_id = %self.project_id, %topic, "subscribed to topic");
                Ok(())
            }
            Err(e) => {
                warn!(project_id = %self.project_id, %topic, error = %e, "subscribe failed");
                Err(e)
            }
        }
    }

    /// Unsubscribe from `topic`. The topic stays tracked until the broker
    /// acknowledges the request.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] when offline, or the broker/timeout error.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let mut topics = self.topics.lock().await;
        if !topics.contains(topic) {
            return Ok(());
        }
        let link = self.current_link().ok_or(BrokerError::NotConnected)?;

        match self.with_ack_timeout("unsubscribe", link.unsubscribe(topic)).await {
            Ok(()) => {
                topics.remove(topic);
                info!(project_id = %self.project_id, %topic, "unsubscribed from topic");
                Ok(())
            }
            Err(e) => {
                warn!(project_id = %self.project_id, %topic, error = %e, "unsubscribe failed");
                Err(e)
            }
        }
    }

    /// Publish `payload` on `topic` and wait for the broker's acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] when offline, or the broker/timeout error.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let link = self.current_link().ok_or(BrokerError::NotConnected)?;
        self.with_ack_timeout("publish", link.publish(topic, payload)).await?;
        info!(project_id = %self.project_id, %topic, bytes = payload.len(), "message published");
        Ok(())
    }

    /// Acknowledged subscriptions, sorted.
    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.topics.lock().await.iter().cloned().collect()
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Replace the set of topics whose messages are written to the data log.
    pub fn set_recorded_topics<I>(&self, topics: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut recorded = self.recorded.write().unwrap_or_else(PoisonError::into_inner);
        *recorded = topics.into_iter().collect();
    }

    #[must_use]
    pub fn records(&self, topic: &str) -> bool {
        self.recorded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(topic)
    }

    /// Drain the link's inbound channel into the buffers. Data log rows go to
    /// the writer task through `log_tx`; a full queue drops the row rather
    /// than stall the transport.
    async fn pump_inbound(
        session: Arc<Self>,
        mut rx: mpsc::Receiver<InboundMessage>,
        log_tx: mpsc::Sender<DataLogEntry>,
        epoch: u64,
    ) {
        while let Some(message) = rx.recv().await {
            let Some(entry) = session.handle_inbound(message) else {
                continue;
            };
            if let Err(TrySendError::Full(entry)) = log_tx.try_send(entry) {
                warn!(project_id = %session.project_id, topic = %entry.topic, "data log queue full; dropping row");
            }
        }
        drop(log_tx);
        session.connection_lost(epoch).await;
    }

    /// Buffer one inbound message. Returns the data log row to append when
    /// its topic feeds a time-series widget.
    pub fn handle_inbound(&self, message: InboundMessage) -> Option<DataLogEntry> {
        let InboundMessage { topic, payload } = message;
        let entry = self.records(&topic).then(|| DataLogEntry {
            topic: topic.clone(),
            payload: payload.clone(),
            received_at: OffsetDateTime::now_utc(),
        });

        let bytes = payload.len();
        let buffer = self.buffer_for(&topic);
        let buffered = {
            let mut buffer = lock(&buffer);
            buffer.push(payload);
            buffer.len()
        };
        debug!(project_id = %self.project_id, %topic, bytes, buffered, "received message");
        entry
    }

    fn buffer_for(&self, topic: &str) -> Arc<StdMutex<TopicBuffer>> {
        if let Some(buffer) = self
            .buffers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
        {
            return Arc::clone(buffer);
        }

        let mut buffers = self.buffers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            buffers
                .entry(topic.to_owned())
                .or_insert_with(|| Arc::new(StdMutex::new(TopicBuffer::new(self.config.topic_buffer_capacity)))),
        )
    }

    fn existing_buffer(&self, topic: &str) -> Option<Arc<StdMutex<TopicBuffer>>> {
        self.buffers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    /// Most recent payload for `topic`, decoded lossily as UTF-8.
    #[must_use]
    pub fn latest_text(&self, topic: &str) -> Option<String> {
        let buffer = self.existing_buffer(topic)?;
        lock(&buffer)
            .latest()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
