//! Pooled connections for SQL wire-protocol clients.
//!
//! - [`pool`]: a generic connection pool with FIFO waiters, a bounded wait
//!   queue, idle/lifetime eviction and transaction helpers
//! - [`pg`]: a PostgreSQL driver (frame decoder, pipelined connection,
//!   TCP factory) that plugs into the pool
//!
//! ```ignore
//! use sqlwire::pg::{PgCommand, PgConnectOptions, PgConnectionFactory};
//! use sqlwire::{Pool, PoolOptions};
//!
//! let factory = PgConnectionFactory::new(PgConnectOptions::new().user("app").password("secret"))?;
//! let pool = Pool::new(factory, PoolOptions::new().max_size(8))?;
//! let results = pool.execute(PgCommand::query("SELECT 1")).await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod pg;
pub mod pool;

pub use config::PoolOptions;
pub use connection::{
    Connection, ConnectionEvent, ConnectionFactory, ConnectionHolder, HolderBinding, HolderId,
    Notification, TransactionCommand,
};
pub use error::{Error, Result};
pub use pool::{LeaseId, Pool, PooledConnection};
