//! Waiter queue and slot accounting.
//!
//! `PoolState` is the bookkeeping half of the pool. It never performs I/O
//! and never calls into user code: every method mutates state under the
//! pool mutex and returns the side effects (grants, connects, failures,
//! closes) as [`Action`]s that the caller runs after unlocking.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;

use crate::config::PoolOptions;
use crate::connection::{Connection, ConnectionEvent, HolderId};
use crate::error::{Error, Result};

pub(crate) type SlotId = u64;

/// Identity of one lease cycle of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterId(u64);

/// A queued request for a connection.
pub(crate) trait Waiter {
    /// The requester stopped waiting (e.g. its future was dropped).
    fn is_abandoned(&self) -> bool;
}

impl<T> Waiter for oneshot::Sender<T> {
    fn is_abandoned(&self) -> bool {
        self.is_closed()
    }
}

// ============================================================================
// Slots
// ============================================================================

struct LeaseState {
    id: LeaseId,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

struct Slot<C> {
    conn: Arc<C>,
    holder: HolderId,
    pipeline: Arc<Semaphore>,
    lease: Option<LeaseState>,
    idle_eviction: Option<Instant>,
    lifetime_eviction: Option<Instant>,
}

impl<C> Slot<C> {
    fn expired(&self, now: Instant) -> bool {
        self.idle_eviction.is_some_and(|t| t <= now)
            || self.lifetime_eviction.is_some_and(|t| t <= now)
    }
}

/// Everything needed to hand a leased slot to its new holder.
pub(crate) struct Grant<C> {
    pub slot: SlotId,
    pub lease: LeaseId,
    pub conn: Arc<C>,
    pub pipeline: Arc<Semaphore>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// A connection taken out of the pool's bookkeeping.
pub(crate) struct Removed<C> {
    pub conn: Arc<C>,
    pub holder: HolderId,
    /// Event channel of the lease holder, if the connection was leased
    pub lease_events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

/// Side effects produced by the dispatch loop.
pub(crate) enum Action<C, W> {
    /// Hand a leased connection to a waiter
    Grant { waiter: W, grant: Grant<C> },
    /// Capacity was reserved; create a connection for this waiter
    Connect { waiter: W },
    /// Fail a waiter
    Fail { waiter: W, error: Error },
    /// Close a connection already removed from the pool
    Close { conn: Arc<C>, holder: HolderId },
}

// ============================================================================
// Pool State
// ============================================================================

pub(crate) struct PoolState<C, W> {
    waiters: VecDeque<(WaiterId, W)>,
    all: HashMap<SlotId, Slot<C>>,
    available: VecDeque<SlotId>,
    /// Physical connections plus connections being created
    size: usize,
    max_size: usize,
    max_wait_queue_size: Option<usize>,
    idle_timeout: Option<Duration>,
    max_lifetime: Option<Duration>,
    pipelined: bool,
    closed: bool,
    next_id: u64,
}

impl<C: Connection, W: Waiter> PoolState<C, W> {
    pub fn new(options: &PoolOptions) -> Self {
        Self {
            waiters: VecDeque::new(),
            all: HashMap::new(),
            available: VecDeque::new(),
            size: 0,
            max_size: options.max_size,
            max_wait_queue_size: options.wait_queue_bound(),
            idle_timeout: options.idle_timeout_opt(),
            max_lifetime: options.max_lifetime_opt(),
            pipelined: options.pipelined,
            closed: false,
            next_id: 0,
        }
    }

    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.available.len()
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    pub fn in_use(&self) -> usize {
        self.all.values().filter(|s| s.lease.is_some()).count()
    }

    /// Queue a waiter. The caller checks `is_closed` first.
    pub fn enqueue(&mut self, waiter: W) -> WaiterId {
        let id = WaiterId(self.next_id());
        self.waiters.push_back((id, waiter));
        id
    }

    /// Remove a still-queued waiter. `None` means it was already served.
    pub fn cancel(&mut self, id: WaiterId) -> Option<W> {
        let pos = self.waiters.iter().position(|(w, _)| *w == id)?;
        self.waiters.remove(pos).map(|(_, w)| w)
    }

    /// Match queued waiters with capacity.
    ///
    /// Idle connections are reused before new ones are created, and waiters
    /// are served oldest first. When the pool is at capacity the wait queue
    /// is trimmed from the back down to its bound.
    pub fn dispatch(&mut self) -> Vec<Action<C, W>> {
        let mut actions = Vec::new();
        if self.closed {
            return actions;
        }
        while let Some((id, waiter)) = self.waiters.pop_front() {
            if waiter.is_abandoned() {
                continue;
            }
            if let Some(slot_id) = self.available.pop_front() {
                match self.lease(slot_id) {
                    Some(grant) => actions.push(Action::Grant { waiter, grant }),
                    None => {
                        // Dead connection: drop it and retry with the same waiter
                        self.waiters.push_front((id, waiter));
                        if let Some(removed) = self.remove(slot_id) {
                            actions.push(Action::Close {
                                conn: removed.conn,
                                holder: removed.holder,
                            });
                        }
                    }
                }
            } else if self.size < self.max_size {
                // Reserve the slot before the connect completes
                self.size += 1;
                actions.push(Action::Connect { waiter });
            } else {
                self.waiters.push_front((id, waiter));
                if let Some(bound) = self.max_wait_queue_size {
                    while self.waiters.len() > bound {
                        if let Some((_, waiter)) = self.waiters.pop_back() {
                            actions.push(Action::Fail {
                                waiter,
                                error: Error::MaxWaitQueueSize,
                            });
                        }
                    }
                }
                break;
            }
        }
        actions
    }

    fn lease(&mut self, slot_id: SlotId) -> Option<Grant<C>> {
        let lease = LeaseId(self.next_id());
        let slot = self.all.get_mut(&slot_id)?;
        if !slot.conn.is_valid() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        slot.lease = Some(LeaseState { id: lease, events: tx });
        Some(Grant {
            slot: slot_id,
            lease,
            conn: Arc::clone(&slot.conn),
            pipeline: Arc::clone(&slot.pipeline),
            events: rx,
        })
    }

    /// Register a freshly created connection, leased to the waiter whose
    /// reservation created it.
    ///
    /// The reservation is released instead when the pool closed meanwhile
    /// (`PoolClosed`) or the connection died before it could be registered
    /// (`ConnectionClosed`); its closed notification found nothing to
    /// remove, so nothing else will.
    pub fn connected(
        &mut self,
        slot_id: SlotId,
        conn: Arc<C>,
        holder: HolderId,
        now: Instant,
    ) -> Result<Grant<C>> {
        if self.closed {
            self.size -= 1;
            return Err(Error::PoolClosed);
        }
        if !conn.is_valid() {
            self.size -= 1;
            return Err(Error::ConnectionClosed);
        }
        let permits = if self.pipelined {
            conn.pipelining_limit().max(1)
        } else {
            1
        };
        self.all.insert(
            slot_id,
            Slot {
                conn,
                holder,
                pipeline: Arc::new(Semaphore::new(permits)),
                lease: None,
                idle_eviction: None,
                lifetime_eviction: self.max_lifetime.map(|d| now + d),
            },
        );
        match self.lease(slot_id) {
            Some(grant) => Ok(grant),
            None => {
                self.remove(slot_id);
                Err(Error::ConnectionClosed)
            }
        }
    }

    /// Give back a reservation whose connect attempt failed.
    pub fn connect_failed(&mut self) {
        self.size -= 1;
    }

    /// Check `lease` is the current lease of `slot_id`.
    pub fn check_lease(&self, slot_id: SlotId, lease: LeaseId) -> Result<()> {
        match self.all.get(&slot_id).map(|s| s.lease.as_ref()) {
            None => Ok(()),
            Some(None) => Err(Error::ReleasedTwice),
            Some(Some(current)) if current.id != lease => Err(Error::ReleasedBy {
                by: lease.to_string(),
                owner: current.id.to_string(),
            }),
            Some(Some(_)) => Ok(()),
        }
    }

    /// End a lease and make the connection available again.
    ///
    /// Releasing a connection the pool no longer tracks (closed or evicted
    /// while leased) is a no-op.
    pub fn release(&mut self, slot_id: SlotId, lease: LeaseId, now: Instant) -> Result<()> {
        self.check_lease(slot_id, lease)?;
        let idle_timeout = self.idle_timeout;
        let Some(slot) = self.all.get_mut(&slot_id) else {
            return Ok(());
        };
        slot.lease = None;
        slot.idle_eviction = idle_timeout.map(|d| now + d);
        if !self.closed {
            self.available.push_back(slot_id);
        }
        Ok(())
    }

    /// Forget a connection whose transport is gone.
    pub fn remove(&mut self, slot_id: SlotId) -> Option<Removed<C>> {
        let slot = self.all.remove(&slot_id)?;
        self.size -= 1;
        if slot.lease.is_none() {
            self.available.retain(|id| *id != slot_id);
        }
        Some(Removed {
            conn: slot.conn,
            holder: slot.holder,
            lease_events: slot.lease.map(|l| l.events),
        })
    }

    /// Event channel of whoever currently leases `slot_id`.
    pub fn lease_events(&self, slot_id: SlotId) -> Option<mpsc::UnboundedSender<ConnectionEvent>> {
        self.all
            .get(&slot_id)
            .and_then(|s| s.lease.as_ref())
            .map(|l| l.events.clone())
    }

    /// Remove idle connections past their idle or lifetime deadline.
    ///
    /// Leased connections are never candidates, even when their deadline
    /// has passed; they are checked again once released.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<Removed<C>> {
        let expired: Vec<SlotId> = self
            .available
            .iter()
            .copied()
            .filter(|id| self.all.get(id).is_some_and(|s| s.expired(now)))
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    /// Mark the pool closed, handing back queued waiters and every
    /// connection to close. Closing twice is an error.
    pub fn close(&mut self) -> Result<(Vec<W>, Vec<(Arc<C>, HolderId)>)> {
        if self.closed {
            return Err(Error::IllegalState(
                "Connection pool already closed".to_string(),
            ));
        }
        self.closed = true;
        let waiters = self.waiters.drain(..).map(|(_, w)| w).collect();
        let conns = self
            .all
            .values()
            .map(|s| (Arc::clone(&s.conn), s.holder))
            .collect();
        self.available.clear();
        Ok((waiters, conns))
    }

    #[cfg(test)]
    pub fn assert_invariants(&self) {
        assert!(self.size <= self.max_size, "size exceeds max size");
        assert!(self.all.len() <= self.size, "untracked connection");
        assert!(self.available.len() <= self.size, "available exceeds size");
        for id in &self.available {
            let slot = self.all.get(id).expect("available slot not in all");
            assert!(slot.lease.is_none(), "available slot is leased");
        }
    }
}
