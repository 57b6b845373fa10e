//! Error types for the connection pool and wire drivers.
//!
//! Pool-level failures (closed, timeout, wait-queue bound) are distinct
//! variants so callers can match on them; connect and command failures
//! coming from a driver pass through unchanged.

use thiserror::Error;

use crate::pg::error::ServerError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication type {0} is not supported in the client")]
    UnsupportedAuthentication(i32),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Server(Box<ServerError>),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Connection pool closed")]
    PoolClosed,

    #[error("Timeout waiting for connection")]
    AcquireTimeout,

    #[error("Timeout waiting for command completion")]
    CommandTimeout,

    #[error("Max waiter size reached")]
    MaxWaitQueueSize,

    #[error("Connection released twice")]
    ReleasedTwice,

    #[error("Connection released by {by} owned by {owner}")]
    ReleasedBy { by: String, owner: String },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Errors that indicate a bug in the calling code or a broken invariant.
    /// These are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ReleasedTwice
                | Error::ReleasedBy { .. }
                | Error::IllegalState(_)
                | Error::UnsupportedAuthentication(_)
        )
    }

    /// Errors a caller may reasonably retry after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectionClosed
                | Error::AcquireTimeout
                | Error::CommandTimeout
                | Error::MaxWaitQueueSize
        )
    }

    /// The server-reported error, if this failure came from the database.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Server(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ServerError> for Error {
    fn from(e: ServerError) -> Self {
        Error::Server(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
