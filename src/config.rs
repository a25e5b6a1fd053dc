//! Service configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Everything is read once at startup. Broker tuning lives in its own
//! `BrokerConfig` so sessions can be built in tests without touching the
//! process environment.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_BROKER_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_BROKER_ACK_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_BROKER_DISCONNECT_GRACE_MS: u64 = 250;
pub const DEFAULT_BROKER_CONNECT_RETRIES: usize = 3;
pub const DEFAULT_BROKER_RETRY_BASE_MS: u64 = 500;
pub const DEFAULT_BROKER_KEEP_ALIVE_SECS: u64 = 30;
pub const DEFAULT_TOPIC_BUFFER_CAPACITY: usize = 256;
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Timeouts and sizing for broker sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Deadline for a single connect handshake.
    pub connect_timeout: Duration,
    /// Deadline for subscribe/unsubscribe/publish acknowledgements.
    pub ack_timeout: Duration,
    /// How long a disconnect waits for the transport to wind down.
    pub disconnect_grace: Duration,
    /// Connect attempts before giving up (at least one is always made).
    pub connect_retries: usize,
    /// First back-off delay; doubles on each further attempt.
    pub retry_base: Duration,
    pub keep_alive: Duration,
    /// Payloads retained per topic buffer.
    pub topic_buffer_capacity: usize,
    /// Inbound messages queued between the transport and the session pump.
    pub inbound_queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_BROKER_CONNECT_TIMEOUT_MS),
            ack_timeout: Duration::from_millis(DEFAULT_BROKER_ACK_TIMEOUT_MS),
            disconnect_grace: Duration::from_millis(DEFAULT_BROKER_DISCONNECT_GRACE_MS),
            connect_retries: DEFAULT_BROKER_CONNECT_RETRIES,
            retry_base: Duration::from_millis(DEFAULT_BROKER_RETRY_BASE_MS),
            keep_alive: Duration::from_secs(DEFAULT_BROKER_KEEP_ALIVE_SECS),
            topic_buffer_capacity: DEFAULT_TOPIC_BUFFER_CAPACITY,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
        }
    }
}

impl BrokerConfig {
    /// Build broker tuning from environment variables, falling back to defaults
    /// for anything missing or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            connect_timeout: Duration::from_millis(env_parse(
                "BROKER_CONNECT_TIMEOUT_MS",
                DEFAULT_BROKER_CONNECT_TIMEOUT_MS,
            )),
            ack_timeout: Duration::from_millis(env_parse("BROKER_ACK_TIMEOUT_MS", DEFAULT_BROKER_ACK_TIMEOUT_MS)),
            disconnect_grace: Duration::from_millis(env_parse(
                "BROKER_DISCONNECT_GRACE_MS",
                DEFAULT_BROKER_DISCONNECT_GRACE_MS,
            )),
            connect_retries: env_parse("BROKER_CONNECT_RETRIES", DEFAULT_BROKER_CONNECT_RETRIES).max(1),
            retry_base: Duration::from_millis(env_parse("BROKER_RETRY_BASE_MS", DEFAULT_BROKER_RETRY_BASE_MS)),
            keep_alive: Duration::from_secs(env_parse("BROKER_KEEP_ALIVE_SECS", DEFAULT_BROKER_KEEP_ALIVE_SECS)),
            topic_buffer_capacity: env_parse("TOPIC_BUFFER_CAPACITY", DEFAULT_TOPIC_BUFFER_CAPACITY).max(1),
            inbound_queue_capacity: env_parse("INBOUND_QUEUE_CAPACITY", DEFAULT_INBOUND_QUEUE_CAPACITY).max(1),
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub broker: BrokerConfig,
}

impl AppConfig {
    /// Build config from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`
    ///
    /// Optional:
    /// - `PORT`: default 3000 (must parse when present)
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - broker tuning, see [`BrokerConfig::from_env`]
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is unset or `PORT` is not a valid port.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid { key: "PORT", value: raw })?,
            Err(_) => DEFAULT_PORT,
        };

        Ok(Self {
            database_url,
            port,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            broker: BrokerConfig::from_env(),
        })
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
