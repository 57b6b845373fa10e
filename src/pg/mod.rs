//! PostgreSQL driver for the pool.
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `decoder`: Frame decoder over the backend byte stream
//! - `command`: Commands, results and command tags
//! - `connection`: Socket task with pipelined command matching
//! - `factory`: Connection settings and TCP connect + startup
//! - `error`: Server error/notice fields

pub mod command;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod factory;
pub mod protocol;

#[cfg(test)]
mod tests;

pub use command::{CommandTag, PgCommand, QueryResult, Row};
pub use connection::PgConnection;
pub use decoder::MessageDecoder;
pub use error::ServerError;
pub use factory::{PgConnectOptions, PgConnectionFactory};
pub use protocol::{BackendMessage, FieldDescription, TransactionStatus};

/// A pool of PostgreSQL connections.
pub type PgPool = crate::pool::Pool<PgConnectionFactory>;
