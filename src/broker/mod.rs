//! Broker connectivity: transport seam, sessions and the session registry.
//!
//! ARCHITECTURE
//! ============
//! `BrokerConnector`/`BrokerLink` abstract the pub/sub transport so sessions
//! can be driven by MQTT in production and by a scripted fake in tests.
//! A `BrokerSession` owns one link plus the per-topic buffers it fills, and
//! the `ConnectionRegistry` guarantees one session per project.

pub mod buffer;
pub mod mqtt;
pub mod registry;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::store::ProjectRow;

pub use registry::ConnectionRegistry;
pub use session::{BrokerSession, ConnectionStatus};

pub const DEFAULT_BROKER_PROTOCOL: &str = "tcp";

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("unsupported broker protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("invalid broker port: {0}")]
    InvalidPort(i32),
    #[error("session is not connected")]
    NotConnected,
    #[error("{op} timed out after {ms}ms")]
    Timeout { op: &'static str, ms: u128 },
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker rejected request: {0}")]
    Rejected(String),
}

impl BrokerError {
    /// Whether another connect attempt could succeed.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout { .. })
    }
}

// =============================================================================
// ENDPOINT
// =============================================================================

/// Broker address of one project: `scheme://host:port` plus the client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl BrokerEndpoint {
    /// Build the endpoint from a project's broker fields.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidPort`] if the stored port does not fit a `u16`.
    pub fn from_project(project: &ProjectRow) -> Result<Self, BrokerError> {
        let port = u16::try_from(project.broker_port).map_err(|_| BrokerError::InvalidPort(project.broker_port))?;
        let scheme = match project.broker_protocol.trim() {
            "" => DEFAULT_BROKER_PROTOCOL.to_owned(),
            other => other.to_ascii_lowercase(),
        };
        Ok(Self {
            scheme,
            host: project.broker_address.clone(),
            port,
            client_id: project.broker_client_id.clone(),
        })
    }

    #[must_use]
    pub fn uri(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

// =============================================================================
// TRANSPORT SEAM
// =============================================================================

/// One message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Opens broker links. Enables swapping the MQTT transport for a fake in tests.
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a link and complete the protocol handshake. Every message the
    /// broker delivers afterwards is pushed into `inbound`; the sender is
    /// dropped when the link goes away.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`] if the transport cannot be opened or the
    /// broker refuses the handshake.
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Arc<dyn BrokerLink>, BrokerError>;
}

/// A live broker connection. Each request resolves once the broker has
/// acknowledged it.
#[async_trait::async_trait]
pub trait BrokerLink: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Close the connection, waiting at most `grace` for the transport to stop.
    async fn disconnect(&self, grace: Duration) -> Result<(), BrokerError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
