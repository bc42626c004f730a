//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking facade that leases a pooled TCP
//! connection per call and returns it afterwards.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides pooling and transport setup.
//! 2. **Generic Commands**: Calls take command vectors and return raw `Value`s;
//!    typed helpers belong to callers.
//! 3. **Serde Config**: `ClientConfig` loads from JSON with per-field defaults.

use std::net::TcpStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::connection::{Connection, Pipeline, Transaction};
use crate::error::{ClientError, ClientResult};
use crate::pool::{Pool, PoolConfig, PooledConnection, TcpConnector};
use crate::resp::Value;

/// Configuration for the synchronous client and its pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Maximum total connections (idle + in-use).
    pub capacity: usize,
    /// Connections opened when the client is created.
    pub prewarm: usize,
    /// How long a call waits for a pooled connection. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:6379".to_string(),
            capacity: 16,
            prewarm: 0,
            acquire_timeout: None,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> ClientResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Synchronous client with connection pooling.
///
/// Each call leases a connection, runs one command or scope, and returns the
/// connection to the pool. Clones share the pool.
#[derive(Debug, Clone)]
pub struct Client {
    pool: Pool<TcpStream>,
    acquire_timeout: Option<Duration>,
}

impl Client {
    /// Creates a client with default configuration.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        Self::with_config(ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        })
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let connector = TcpConnector::new(&config.addr)?
            .read_timeout(config.read_timeout)
            .write_timeout(config.write_timeout)
            .connect_timeout(config.connect_timeout);
        let pool = Pool::new(
            PoolConfig {
                capacity: config.capacity,
                prewarm: config.prewarm,
            },
            connector,
        )?;
        Ok(Client {
            pool,
            acquire_timeout: config.acquire_timeout,
        })
    }

    /// Sends one command on a pooled connection.
    pub fn send<'a>(&self, command: impl Into<Command<'a>>) -> ClientResult<Value> {
        self.lease()?.send(command)
    }

    /// Runs a pipeline on one pooled connection.
    pub fn pipeline<F, E>(&self, body: F) -> Result<Vec<Value>, E>
    where
        F: FnOnce(&mut Pipeline<'_, TcpStream>) -> Result<(), E>,
        E: From<ClientError>,
    {
        self.lease()?.pipeline(body)
    }

    /// Runs a MULTI/EXEC transaction on one pooled connection.
    pub fn transaction<F, E>(&self, body: F) -> Result<Value, E>
    where
        F: FnOnce(&mut Transaction<'_, TcpStream>) -> Result<(), E>,
        E: From<ClientError>,
    {
        self.lease()?.transaction(body)
    }

    /// Leases a connection for several calls in a row.
    pub fn with_connection<F, R, E>(&self, body: F) -> Result<R, E>
    where
        F: FnOnce(&mut Connection<TcpStream>) -> Result<R, E>,
        E: From<ClientError>,
    {
        self.pool.scoped_acquire(self.acquire_timeout, body)
    }

    /// The underlying pool, for explicit leases and introspection.
    pub fn pool(&self) -> &Pool<TcpStream> {
        &self.pool
    }

    fn lease(&self) -> ClientResult<PooledConnection<TcpStream>> {
        self.pool.acquire(self.acquire_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config = ClientConfig::from_json(r#"{ "addr": "10.0.0.1:7000", "capacity": 4 }"#).unwrap();
        assert_eq!(config.addr, "10.0.0.1:7000");
        assert_eq!(config.capacity, 4);
        assert_eq!(config.prewarm, 0);
        assert_eq!(config.acquire_timeout, None);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = ClientConfig {
            acquire_timeout: Some(Duration::from_millis(250)),
            ..ClientConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ClientConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn invalid_json_is_config_error() {
        let err = ClientConfig::from_json("{ capacity: }").unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn invalid_address_fails_fast() {
        let err = Client::connect("localhost-no-port").unwrap_err();
        assert!(matches!(err, ClientError::InvalidAddress(_)));
    }
}
