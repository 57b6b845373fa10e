//! Generic connection pool.
//!
//! The pool hands out exclusive leases on connections produced by a
//! [`ConnectionFactory`]. Bookkeeping lives in [`core`] and is mutated only
//! under one mutex; every side effect (completing a waiter, connecting,
//! closing a connection) runs after the lock is dropped, so connection and
//! waiter callbacks may re-enter the pool freely.
//!
//! ```ignore
//! let pool = Pool::new(PgConnectionFactory::new(options)?, PoolOptions::new().max_size(8))?;
//! let result = pool.execute(PgCommand::query("SELECT 1")).await?;
//! ```

mod core;
mod pooled;
mod sweeper;


use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolOptions;
use crate::connection::{
    Connection, ConnectionEvent, ConnectionFactory, ConnectionHolder, HolderId,
    TransactionCommand,
};
use crate::error::{Error, Result};

use self::core::{Action, Grant, PoolState, SlotId};
use self::pooled::LeaseOwner;

pub use self::core::LeaseId;
pub use self::pooled::PooledConnection;

type Conn<F> = <F as ConnectionFactory>::Connection;
type Reply<C> = oneshot::Sender<Result<PooledConnection<C>>>;

/// Async initializer run on each freshly created connection.
pub type ConnectHook<C> =
    Arc<dyn for<'c> Fn(&'c mut PooledConnection<C>) -> BoxFuture<'c, Result<()>> + Send + Sync>;

// ============================================================================
// Pool Inner
// ============================================================================

pub(crate) struct PoolInner<F: ConnectionFactory> {
    factory: F,
    options: PoolOptions,
    state: Mutex<PoolState<Conn<F>, Reply<Conn<F>>>>,
    connect_hook: Option<ConnectHook<Conn<F>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    weak: Weak<Self>,
}

impl<F: ConnectionFactory> PoolInner<F> {
    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    fn owner(self: &Arc<Self>) -> Arc<dyn LeaseOwner<Conn<F>>> {
        Arc::clone(self) as Arc<dyn LeaseOwner<Conn<F>>>
    }

    /// Run the side effects computed under the lock.
    fn run(self: &Arc<Self>, actions: Vec<Action<Conn<F>, Reply<Conn<F>>>>) {
        for action in actions {
            match action {
                Action::Grant { waiter, grant } => {
                    debug!(lease = %grant.lease, "granting idle connection");
                    self.grant(waiter, grant);
                }
                Action::Connect { waiter } => {
                    let pool = Arc::clone(self);
                    tokio::spawn(async move { pool.connect(waiter).await });
                }
                Action::Fail { waiter, error } => {
                    debug!(error = %error, "failing waiter");
                    let _ = waiter.send(Err(error));
                }
                Action::Close { conn, holder } => {
                    debug!(holder = %holder, "closing invalid connection");
                    if let Err(e) = conn.close(holder) {
                        debug!(error = %e, "close failed");
                    }
                }
            }
        }
    }

    fn grant(self: &Arc<Self>, waiter: Reply<Conn<F>>, grant: Grant<Conn<F>>) {
        let pooled = PooledConnection::new(grant, self.owner());
        // A waiter that went away drops the handle, which recycles it
        let _ = waiter.send(Ok(pooled));
    }

    async fn connect(self: Arc<Self>, waiter: Reply<Conn<F>>) {
        debug!("creating connection");
        let conn = match self.factory.connect().await {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.connect_failed(waiter, e);
                return;
            }
        };

        let (slot, holder) = {
            let mut state = self.state.lock();
            (state.next_id(), HolderId(state.next_id()))
        };
        let slot_holder = Arc::new(SlotHolder {
            pool: Weak::clone(&self.weak),
            slot,
        });
        if let Err(e) = conn.init(holder, slot_holder) {
            warn!(error = %e, "connection init failed");
            self.connect_failed(waiter, e);
            return;
        }
        if !conn.is_valid() {
            self.connect_failed(waiter, Error::ConnectionClosed);
            return;
        }

        let registered = {
            let mut state = self.state.lock();
            match state.connected(slot, Arc::clone(&conn), holder, Instant::now()) {
                Ok(grant) => Ok(grant),
                // The freed reservation may serve someone else
                Err(e) => Err((e, state.dispatch())),
            }
        };
        let grant = match registered {
            Ok(grant) => grant,
            Err((e, actions)) => {
                debug!(error = %e, "new connection not registered");
                // Already unbound if the transport closed on its own
                if let Err(close) = conn.close(holder) {
                    debug!(error = %close, "close failed");
                }
                let _ = waiter.send(Err(e));
                self.run(actions);
                return;
            }
        };
        debug!(lease = %grant.lease, "connection created");

        let mut pooled = PooledConnection::new(grant, self.owner());
        if let Some(hook) = &self.connect_hook {
            if let Err(e) = hook(&mut pooled).await {
                warn!(error = %e, "connect hook failed");
                pooled.discard();
                let _ = waiter.send(Err(e));
                return;
            }
        }
        let _ = waiter.send(Ok(pooled));
    }

    fn connect_failed(self: &Arc<Self>, waiter: Reply<Conn<F>>, error: Error) {
        let actions = {
            let mut state = self.state.lock();
            state.connect_failed();
            state.dispatch()
        };
        let _ = waiter.send(Err(error));
        self.run(actions);
    }

    fn handle_closed(self: &Arc<Self>, slot: SlotId) {
        let (removed, actions) = {
            let mut state = self.state.lock();
            let removed = state.remove(slot);
            (removed, state.dispatch())
        };
        match removed {
            Some(removed) => {
                debug!(holder = %removed.holder, "connection closed");
                if let Some(events) = removed.lease_events {
                    let _ = events.send(ConnectionEvent::Closed);
                }
            }
            None => debug!("closed connection was no longer pooled"),
        }
        self.run(actions);
    }

    fn forward_event(&self, slot: SlotId, event: ConnectionEvent) {
        let events = self.state.lock().lease_events(slot);
        match (events, event) {
            (Some(events), event) => {
                let _ = events.send(event);
            }
            (None, ConnectionEvent::Exception(e)) => {
                debug!(error = %e, "exception on idle connection");
            }
            (None, _) => {}
        }
    }

    fn release(self: &Arc<Self>, slot: SlotId, lease: LeaseId) -> Result<()> {
        let actions = {
            let mut state = self.state.lock();
            state.release(slot, lease, Instant::now())?;
            state.dispatch()
        };
        debug!(lease = %lease, "connection released");
        self.run(actions);
        Ok(())
    }

    pub(crate) fn evict_expired(self: &Arc<Self>) {
        let (removed, actions) = {
            let mut state = self.state.lock();
            let removed = state.evict_expired(Instant::now());
            (removed, state.dispatch())
        };
        for r in removed {
            debug!(holder = %r.holder, "evicting expired connection");
            if let Err(e) = r.conn.close(r.holder) {
                debug!(error = %e, "close failed");
            }
        }
        self.run(actions);
    }
}

impl<F: ConnectionFactory> LeaseOwner<Conn<F>> for PoolInner<F> {
    fn recycle(self: Arc<Self>, slot: SlotId, lease: LeaseId, conn: Arc<Conn<F>>) -> Result<()> {
        if !(conn.is_valid() && conn.needs_reset()) {
            return self.release(slot, lease);
        }
        self.state.lock().check_lease(slot, lease)?;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match conn.reset().await {
                        Ok(()) => {
                            if let Err(e) = self.release(slot, lease) {
                                warn!(lease = %lease, error = %e, "release after reset failed");
                            }
                        }
                        Err(e) => {
                            warn!(lease = %lease, error = %e, "reset failed, closing connection");
                            self.discard(slot);
                        }
                    }
                });
            }
            Err(_) => self.discard(slot),
        }
        Ok(())
    }

    fn discard(&self, slot: SlotId) {
        let removed = self.state.lock().remove(slot);
        if let Some(removed) = removed {
            debug!(holder = %removed.holder, "discarding connection");
            if let Err(e) = removed.conn.close(removed.holder) {
                debug!(error = %e, "close failed");
            }
        }
        // Capacity freed: serve anyone queued
        if let Some(pool) = self.weak.upgrade() {
            let actions = pool.state.lock().dispatch();
            pool.run(actions);
        }
    }
}

/// The holder registered with each raw connection while it is pooled.
struct SlotHolder<F: ConnectionFactory> {
    pool: Weak<PoolInner<F>>,
    slot: SlotId,
}

impl<F: ConnectionFactory> ConnectionHolder for SlotHolder<F> {
    fn handle_closed(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.handle_closed(self.slot);
        }
    }

    fn handle_event(&self, event: ConnectionEvent) {
        if let Some(pool) = self.pool.upgrade() {
            pool.forward_event(self.slot, event);
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// A pool of connections with FIFO waiters.
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool. Connections are created lazily on demand.
    ///
    /// Starting the eviction sweeper requires a tokio runtime.
    pub fn new(factory: F, options: PoolOptions) -> Result<Self> {
        Self::build(factory, options, None)
    }

    /// Create a pool that runs `hook` on each new connection before handing
    /// it out. A failing hook closes the connection and fails the waiter.
    pub fn with_connect_hook<H>(factory: F, options: PoolOptions, hook: H) -> Result<Self>
    where
        H: for<'c> Fn(&'c mut PooledConnection<Conn<F>>) -> BoxFuture<'c, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        Self::build(factory, options, Some(Arc::new(hook)))
    }

    fn build(
        factory: F,
        options: PoolOptions,
        connect_hook: Option<ConnectHook<Conn<F>>>,
    ) -> Result<Self> {
        options.validate()?;
        let inner = Arc::new_cyclic(|weak| PoolInner {
            factory,
            state: Mutex::new(PoolState::new(&options)),
            options: options.clone(),
            connect_hook,
            sweeper: Mutex::new(None),
            weak: Weak::clone(weak),
        });

        if options.eviction_enabled() {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(Error::Config(
                    "Eviction requires a running tokio runtime".to_string(),
                ));
            }
            let handle = sweeper::spawn(Arc::downgrade(&inner), options.cleaner_period);
            *inner.sweeper.lock() = Some(handle);
        }

        info!(max_size = options.max_size, "connection pool created");
        Ok(Self { inner })
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Lease a connection, waiting at most `connection_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection<Conn<F>>> {
        self.acquire_timeout(self.inner.options.connection_timeout_opt())
            .await
    }

    /// Lease a connection, waiting at most `timeout` (`None` waits forever).
    ///
    /// When the timer fires while a connection is already being created for
    /// this caller, the grant wins and the call still succeeds.
    pub async fn acquire_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<PooledConnection<Conn<F>>> {
        let (tx, mut rx) = oneshot::channel();
        let (id, actions) = {
            let mut state = self.inner.state.lock();
            if state.is_closed() {
                return Err(Error::PoolClosed);
            }
            let id = state.enqueue(tx);
            (id, state.dispatch())
        };
        self.inner.run(actions);

        let Some(timeout) = timeout else {
            return rx.await.unwrap_or(Err(Error::PoolClosed));
        };
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(result) => result.unwrap_or(Err(Error::PoolClosed)),
            Err(_) => {
                let cancelled = self.inner.state.lock().cancel(id);
                if cancelled.is_some() {
                    debug!("acquire timed out");
                    return Err(Error::AcquireTimeout);
                }
                rx.await.unwrap_or(Err(Error::PoolClosed))
            }
        }
    }

    /// Run one command on a pooled connection, waiting at most
    /// `command_timeout`.
    pub async fn execute(
        &self,
        command: <Conn<F> as Connection>::Command,
    ) -> Result<<Conn<F> as Connection>::Output> {
        self.execute_timeout(command, self.inner.options.command_timeout_opt())
            .await
    }

    /// Run one command on a pooled connection, waiting at most `timeout`.
    ///
    /// A timeout stops the wait, not the command: it keeps running in the
    /// background and its connection returns to the pool once the server
    /// answers, so its effects may still land after `CommandTimeout`.
    pub async fn execute_timeout(
        &self,
        command: <Conn<F> as Connection>::Command,
        timeout: Option<Duration>,
    ) -> Result<<Conn<F> as Connection>::Output> {
        let pool = self.clone();
        let task = tokio::spawn(async move {
            let conn = pool.acquire().await?;
            conn.schedule(command).await
        });
        let joined = match timeout {
            None => task.await,
            Some(timeout) => match tokio::time::timeout(timeout, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    debug!("command timed out, leaving it to complete in the background");
                    return Err(Error::CommandTimeout);
                }
            },
        };
        joined.map_err(|e| Error::IllegalState(format!("command task failed: {}", e)))?
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` succeeds and rolls back when it fails; a failing
    /// rollback is logged and the error from `f` is returned. The connection
    /// is released either way.
    pub async fn with_transaction<T, Fun>(&self, f: Fun) -> Result<T>
    where
        <Conn<F> as Connection>::Command: TransactionCommand,
        Fun: for<'c> FnOnce(&'c mut PooledConnection<Conn<F>>) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.acquire().await?;
        conn.schedule(TransactionCommand::begin()).await?;
        match f(&mut conn).await {
            Ok(value) => {
                conn.schedule(TransactionCommand::commit()).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = conn.schedule(TransactionCommand::rollback()).await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Close the pool: fail queued waiters and close every connection.
    ///
    /// Closing twice is an error. Leased connections are closed too; their
    /// holders see `ConnectionEvent::Closed`.
    pub fn close(&self) -> Result<()> {
        let (waiters, conns) = self.inner.state.lock().close()?;
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
        info!(
            waiters = waiters.len(),
            connections = conns.len(),
            "closing connection pool"
        );
        for waiter in waiters {
            let _ = waiter.send(Err(Error::PoolClosed));
        }
        for (conn, holder) in conns {
            if let Err(e) = conn.close(holder) {
                debug!(holder = %holder, error = %e, "close failed");
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Physical connections, including those being created.
    pub fn size(&self) -> usize {
        self.inner.state.lock().size()
    }

    /// Idle connections ready for reuse.
    pub fn available(&self) -> usize {
        self.inner.state.lock().available()
    }

    /// Queued waiters.
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiting()
    }

    /// Leased connections.
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().in_use()
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        self.inner.state.lock().assert_invariants();
    }
}
