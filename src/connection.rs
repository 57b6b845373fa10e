//! Collaborator interfaces consumed by the pool.
//!
//! A driver plugs into the pool by providing a [`ConnectionFactory`] that
//! produces [`Connection`]s. Each connection reports lifecycle events to a
//! single registered [`ConnectionHolder`]; the pool is that holder while the
//! connection is pooled.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};

// ============================================================================
// Holder
// ============================================================================

/// Identity of the entity a connection is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderId(pub u64);

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "holder#{}", self.0)
    }
}

/// Asynchronous notification from the server side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Events a connection delivers to its holder.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The transport is gone. Delivered at most once.
    Closed,
    /// An error not tied to any scheduled command.
    Exception(Arc<Error>),
    /// A server notification (e.g. LISTEN/NOTIFY).
    Notification(Notification),
}

/// Receiver of a connection's events.
pub trait ConnectionHolder: Send + Sync {
    /// The transport closed. Called exactly once per connection.
    fn handle_closed(&self);

    /// An exception or notification arrived.
    fn handle_event(&self, event: ConnectionEvent);
}

/// The holder slot of a connection.
///
/// Drivers embed this to get the binding rules right: one `bind` per
/// connection, `close` only from the bound holder, and a single closed
/// notification that also unregisters the holder.
#[derive(Default)]
pub struct HolderBinding {
    holder: Mutex<Option<(HolderId, Arc<dyn ConnectionHolder>)>>,
    closed: AtomicBool,
}

impl HolderBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the holder. Binding twice is a programmer error.
    pub fn bind(&self, id: HolderId, holder: Arc<dyn ConnectionHolder>) -> Result<()> {
        let mut slot = self.holder.lock();
        if let Some((current, _)) = slot.as_ref() {
            return Err(Error::IllegalState(format!(
                "connection already bound to {}",
                current
            )));
        }
        *slot = Some((id, holder));
        Ok(())
    }

    /// Check `id` is the bound holder.
    pub fn check(&self, id: HolderId) -> Result<()> {
        match self.holder.lock().as_ref() {
            Some((current, _)) if *current == id => Ok(()),
            Some((current, _)) => Err(Error::IllegalState(format!(
                "connection closed by {} but bound to {}",
                id, current
            ))),
            None if self.closed.load(Ordering::Acquire) => Err(Error::ConnectionClosed),
            None => Err(Error::IllegalState(format!(
                "connection closed by {} but not bound",
                id
            ))),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.holder.lock().is_some()
    }

    /// Forward an event to the holder, if any.
    pub fn emit(&self, event: ConnectionEvent) {
        let holder = self.holder.lock().as_ref().map(|(_, h)| Arc::clone(h));
        if let Some(holder) = holder {
            holder.handle_event(event);
        }
    }

    /// Unregister the holder and tell it the transport closed.
    ///
    /// Only the first call has an effect.
    pub fn notify_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let holder = self.holder.lock().take();
        if let Some((_, holder)) = holder {
            holder.handle_closed();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One physical, stateful channel to a database server.
///
/// A connection is owned by exactly one holder at a time and is never
/// shared between unrelated logical operations.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// The unit of work this connection runs.
    type Command: Send + 'static;
    /// What a completed command yields.
    type Output: Send + 'static;

    /// Send a command and wait for its response.
    ///
    /// Up to `pipelining_limit()` calls may be outstanding at once; responses
    /// complete in submission order.
    async fn schedule(&self, command: Self::Command) -> Result<Self::Output>;

    /// Bind the single holder of this connection.
    fn init(&self, id: HolderId, holder: Arc<dyn ConnectionHolder>) -> Result<()>;

    /// Close the connection on behalf of the bound holder.
    ///
    /// The holder is told through `handle_closed` once the transport is gone.
    fn close(&self, id: HolderId) -> Result<()>;

    /// Whether the connection can still run commands.
    fn is_valid(&self) -> bool;

    /// How many commands may be in flight at once.
    fn pipelining_limit(&self) -> usize {
        1
    }

    /// Whether session state must be reset before the connection is reused.
    fn needs_reset(&self) -> bool {
        false
    }

    /// Reset session state (e.g. roll back an open transaction).
    async fn reset(&self) -> Result<()> {
        Ok(())
    }
}

/// Commands able to drive a transaction.
pub trait TransactionCommand: Sized {
    fn begin() -> Self;
    fn commit() -> Self;
    fn rollback() -> Self;
}

// ============================================================================
// Connection Factory
// ============================================================================

/// Produces new connections.
///
/// A connection is only returned once fully usable; any failure during
/// connect or startup is reported as an error instead.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self) -> Result<Self::Connection>;
}
