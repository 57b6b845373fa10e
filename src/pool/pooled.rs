//! Leased connection handle.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{trace, warn};

use super::core::{Grant, LeaseId, SlotId};
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{Error, Result};

/// The pool side of a lease.
pub(crate) trait LeaseOwner<C>: Send + Sync {
    /// End the lease and hand the connection back for reuse.
    fn recycle(self: Arc<Self>, slot: SlotId, lease: LeaseId, conn: Arc<C>) -> Result<()>;

    /// End the lease and close the connection.
    fn discard(&self, slot: SlotId);
}

/// A connection leased from a [`Pool`](super::Pool).
///
/// The lease ends exactly once: either through [`release`](Self::release)
/// or when the handle is dropped. Commands are proxied to the physical
/// connection; unless the pool is pipelined, only one runs at a time.
pub struct PooledConnection<C: Connection> {
    conn: Arc<C>,
    slot: SlotId,
    lease: LeaseId,
    pipeline: Arc<Semaphore>,
    events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    owner: Arc<dyn LeaseOwner<C>>,
    released: bool,
}

impl<C: Connection> PooledConnection<C> {
    pub(crate) fn new(grant: Grant<C>, owner: Arc<dyn LeaseOwner<C>>) -> Self {
        Self {
            conn: grant.conn,
            slot: grant.slot,
            lease: grant.lease,
            pipeline: grant.pipeline,
            events: Some(grant.events),
            owner,
            released: false,
        }
    }

    /// Identity of this lease.
    pub fn lease_id(&self) -> LeaseId {
        self.lease
    }

    /// Run a command on the leased connection.
    pub async fn schedule(&self, command: C::Command) -> Result<C::Output> {
        if self.released {
            return Err(Error::IllegalState(format!(
                "{} used after release",
                self.lease
            )));
        }
        let _permit = self
            .pipeline
            .acquire()
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        trace!(lease = %self.lease, "scheduling command");
        self.conn.schedule(command).await
    }

    /// Whether the underlying connection can still run commands.
    pub fn is_valid(&self) -> bool {
        !self.released && self.conn.is_valid()
    }

    /// Take the stream of events delivered to this lease: exceptions and
    /// notifications from the connection, then `Closed` if the transport
    /// goes away while leased. Only the first call returns `Some`.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.take()
    }

    /// Give the connection back to the pool.
    ///
    /// A second call fails with [`Error::ReleasedTwice`].
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(Error::ReleasedTwice);
        }
        self.released = true;
        Arc::clone(&self.owner).recycle(self.slot, self.lease, Arc::clone(&self.conn))
    }

    /// Close the physical connection instead of returning it.
    pub fn discard(mut self) {
        self.released = true;
        self.owner.discard(self.slot);
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) =
            Arc::clone(&self.owner).recycle(self.slot, self.lease, Arc::clone(&self.conn))
        {
            warn!(lease = %self.lease, error = %e, "failed to recycle connection");
        }
    }
}

impl<C: Connection> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("lease", &self.lease)
            .field("released", &self.released)
            .finish()
    }
}
