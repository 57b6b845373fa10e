//! Connection settings and the TCP connection factory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;

use super::connection::PgConnection;
use crate::connection::ConnectionFactory;
use crate::error::{Error, Result};

// ============================================================================
// Connection Options
// ============================================================================

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgConnectOptions {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 5432)
    pub port: u16,
    /// Database name
    pub database: String,
    /// Username
    pub user: String,
    /// Password (optional)
    pub password: Option<String>,
    /// Application name (optional)
    pub application_name: Option<String>,
    /// Maximum outstanding commands per connection (default: 256)
    pub pipelining_limit: usize,
}

impl Default for PgConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: None,
            application_name: Some("sqlwire".to_string()),
            pipelining_limit: 256,
        }
    }
}

impl PgConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn pipelining_limit(mut self, limit: usize) -> Self {
        self.pipelining_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipelining_limit == 0 {
            return Err(Error::Config(
                "Pipelining limit must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// The password, for servers that ask for one.
    pub(crate) fn required_password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| Error::Auth("Password required".to_string()))
    }
}

// ============================================================================
// Connection Factory
// ============================================================================

/// Opens TCP connections and runs the startup handshake.
#[derive(Debug, Clone)]
pub struct PgConnectionFactory {
    options: PgConnectOptions,
}

impl PgConnectionFactory {
    pub fn new(options: PgConnectOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &PgConnectOptions {
        &self.options
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection> {
        let addr = format!("{}:{}", self.options.host, self.options.port);
        debug!(addr = %addr, "opening connection");

        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;

        PgConnection::handshake(stream, &self.options).await
    }
}
