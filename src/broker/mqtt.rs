//! MQTT transport built on `rumqttc`.
//!
//! DESIGN
//! ======
//! `rumqttc` splits a connection into an `AsyncClient` (request handle) and an
//! `EventLoop` that must be polled to make progress. The connector polls the
//! loop itself until CONNACK, then hands it to a background task that:
//! - forwards PUBLISH packets into the session's inbound channel
//! - keys each pending request by the packet id of its outgoing packet
//! - resolves SUBACK/UNSUBACK/PUBACK waiters by that packet id
//! - stops on a clean disconnect or a transport error, failing any waiters
//!
//! Requests are serialized by `request_lock` so the queue of unsent waiters
//! matches the order packets leave the client.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS, SubscribeReasonCode,
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BrokerConnector, BrokerEndpoint, BrokerError, BrokerLink, InboundMessage};
use crate::config::BrokerConfig;

/// Schemes served over plain TCP. TLS variants are not supported.
pub const SUPPORTED_SCHEMES: &[&str] = &["tcp", "mqtt"];

const REQUEST_CHANNEL_CAPACITY: usize = 64;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn generated_client_id() -> String {
    format!("mqtt-dashboard-{:08x}", rand::random::<u32>())
}

// =============================================================================
// PENDING ACKS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum AckKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

type Waiter = oneshot::Sender<Result<(), BrokerError>>;
pub(crate) type AckReceiver = oneshot::Receiver<Result<(), BrokerError>>;

struct Entry {
    ticket: u64,
    waiter: Waiter,
}

#[derive(Default)]
struct PendingInner {
    next_ticket: u64,
    subscribe: VecDeque<Entry>,
    unsubscribe: VecDeque<Entry>,
    publish: VecDeque<Entry>,
    in_flight: HashMap<(AckKind, u16), Entry>,
    closed: bool,
}

impl PendingInner {
    fn queue(&mut self, kind: AckKind) -> &mut VecDeque<Entry> {
        match kind {
            AckKind::Subscribe => &mut self.subscribe,
            AckKind::Unsubscribe => &mut self.unsubscribe,
            AckKind::Publish => &mut self.publish,
        }
    }
}

/// Callers waiting on broker acknowledgements.
///
/// A waiter starts in a per-kind queue of requests handed to the client but
/// not yet written. When the event loop reports the outgoing packet, the head
/// of that queue is keyed by the packet id it was given, and the matching ack
/// resolves exactly that waiter.
#[derive(Default)]
pub(crate) struct PendingAcks {
    inner: StdMutex<PendingInner>,
}

impl PendingAcks {
    pub(crate) fn register(&self, kind: AckKind) -> Result<(u64, AckReceiver), BrokerError> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(BrokerError::NotConnected);
        }
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        let (waiter, rx) = oneshot::channel();
        inner.queue(kind).push_back(Entry { ticket, waiter });
        Ok((ticket, rx))
    }

    /// Remove a waiter whose request never reached the client.
    pub(crate) fn withdraw(&self, kind: AckKind, ticket: u64) {
        lock(&self.inner).queue(kind).retain(|entry| entry.ticket != ticket);
    }

    /// The event loop wrote the next packet of `kind` with id `pkid`.
    pub(crate) fn sent(&self, kind: AckKind, pkid: u16) {
        let mut inner = lock(&self.inner);
        match inner.queue(kind).pop_front() {
            Some(entry) => {
                inner.in_flight.insert((kind, pkid), entry);
            }
            None => debug!(?kind, pkid, "outgoing packet without a pending request"),
        }
    }

    pub(crate) fn resolve(&self, kind: AckKind, pkid: u16, outcome: Result<(), BrokerError>) {
        let entry = lock(&self.inner).in_flight.remove(&(kind, pkid));
        match entry {
            Some(entry) => {
                let _ = entry.waiter.send(outcome);
            }
            None => debug!(?kind, pkid, "ack without a pending request"),
        }
    }

    /// Fail every waiter and refuse new registrations.
    pub(crate) fn fail_all(&self, reason: &str) {
        let entries: Vec<Entry> = {
            let mut inner = lock(&self.inner);
            inner.closed = true;
            let mut entries: Vec<Entry> = inner.subscribe.drain(..).collect();
            entries.extend(inner.unsubscribe.drain(..));
            entries.extend(inner.publish.drain(..));
            entries.extend(inner.in_flight.drain().map(|(_, entry)| entry));
            entries
        };
        for entry in entries {
            let _ = entry.waiter.send(Err(BrokerError::Connection(reason.to_owned())));
        }
    }
}

/// Withdraws a registered waiter unless disarmed once its request is queued
/// on the client. Covers both send errors and a caller that gives up while
/// the send is still waiting for channel capacity.
pub(crate) struct UnsentGuard<'a> {
    acks: &'a PendingAcks,
    kind: AckKind,
    ticket: u64,
    armed: bool,
}

impl<'a> UnsentGuard<'a> {
    pub(crate) fn new(acks: &'a PendingAcks, kind: AckKind, ticket: u64) -> Self {
        Self { acks, kind, ticket, armed: true }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for UnsentGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.acks.withdraw(self.kind, self.ticket);
        }
    }
}

// =============================================================================
// CONNECTOR
// =============================================================================

pub struct MqttConnector {
    keep_alive: Duration,
    request_capacity: usize,
}

impl MqttConnector {
    #[must_use]
    pub fn new(config: &BrokerConfig) -> Self {
        Self { keep_alive: config.keep_alive.max(Duration::from_secs(1)), request_capacity: REQUEST_CHANNEL_CAPACITY }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BrokerError::Rejected(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(BrokerError::Rejected(format!("{code:?}")));
            }
            Err(e) => return Err(BrokerError::Connection(e.to_string())),
        }
    }
}

async fn drive_event_loop(mut eventloop: EventLoop, inbound: mpsc::Sender<InboundMessage>, acks: Arc<PendingAcks>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage { topic: publish.topic, payload: publish.payload.to_vec() };
                if inbound.send(message).await.is_err() {
                    debug!("inbound receiver dropped; stopping event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let outcome = if ack.return_codes.iter().any(|code| matches!(code, SubscribeReasonCode::Failure)) {
                    Err(BrokerError::Rejected("subscription refused".into()))
                } else {
                    Ok(())
                };
                acks.resolve(AckKind::Subscribe, ack.pkid, outcome);
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => acks.resolve(AckKind::Unsubscribe, ack.pkid, Ok(())),
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.resolve(AckKind::Publish, ack.pkid, Ok(())),
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => acks.sent(AckKind::Subscribe, pkid),
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => acks.sent(AckKind::Unsubscribe, pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.sent(AckKind::Publish, pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("mqtt disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt event loop stopped");
                break;
            }
        }
    }
    acks.fail_all("connection closed");
}

#[async_trait::async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Arc<dyn BrokerLink>, BrokerError> {
        if !SUPPORTED_SCHEMES.contains(&endpoint.scheme.as_str()) {
            return Err(BrokerError::UnsupportedProtocol(endpoint.scheme.clone()));
        }

        let client_id = match endpoint.client_id.trim() {
            "" => generated_client_id(),
            id => id.to_owned(),
        };
        let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, self.request_capacity);
        wait_for_connack(&mut eventloop).await?;

        let acks = Arc::new(PendingAcks::default());
        let task = tokio::spawn(drive_event_loop(eventloop, inbound, Arc::clone(&acks)));
        Ok(Arc::new(MqttLink { client, acks, request_lock: Mutex::new(()), task: StdMutex::new(Some(task)) }))
    }
}

// =============================================================================
// LINK
// =============================================================================

pub struct MqttLink {
    client: AsyncClient,
    acks: Arc<PendingAcks>,
    request_lock: Mutex<()>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    async fn request<F, Fut>(&self, kind: AckKind, send: F) -> Result<(), BrokerError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), ClientError>> + Send,
    {
        let ack = {
            let _request = self.request_lock.lock().await;
            let (ticket, ack) = self.acks.register(kind)?;
            let guard = UnsentGuard::new(&self.acks, kind, ticket);
            send().await.map_err(|e| BrokerError::Connection(e.to_string()))?;
            guard.disarm();
            ack
        };
        ack.await.unwrap_or(Err(BrokerError::NotConnected))
    }
}

#[async_trait::async_trait]
impl BrokerLink for MqttLink {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.request(AckKind::Subscribe, || self.client.subscribe(topic, QoS::AtMostOnce))
            .await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.request(AckKind::Unsubscribe, || self.client.unsubscribe(topic)).await
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let payload = payload.to_vec();
        self.request(AckKind::Publish, || self.client.publish(topic, QoS::AtLeastOnce, false, payload))
            .await
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), BrokerError> {
        let sent = self.client.try_disconnect();
        let task = lock(&self.task).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                debug!(grace_ms = grace.as_millis(), "mqtt event loop did not stop in time; aborting");
                task.abort();
            }
        }
        self.acks.fail_all("disconnected");
        sent.map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "mqtt_test.rs"]
mod tests;
