//! Generic bounded connection pool.
//!
//! # Design Decisions
//!
//! - **`Semaphore` with `max` permits**: a permit is held for as long as a connection
//!   is on loan, so no more than `max` connections are ever lent at once. Tokio's
//!   semaphore queues waiters first-come-first-served.
//! - **Permit before connection**: an acquirer first waits for a slot, then reuses an
//!   idle connection or creates a new one. Waiting and creating share one deadline
//!   (`acquire_timeout`); on expiry the create future is dropped, so no half-open
//!   connection is left behind.
//! - **Idle list under `parking_lot::Mutex`**: never held across an await point.
//!   Connections are reused most-recently-released first so the oldest idle ones
//!   age out.
//! - **Maintenance task with a `Weak` reference**: evicts idle connections above
//!   `min`, refills up to `min`, and destroys connections an [`ErrorListener`]
//!   reported dead. It exits when the pool is dropped or closed.
//!
//! # Panic Safety
//!
//! A [`PooledConnection`] dropped without `release` (early return, panic) frees its
//! slot immediately and its native connection is closed on a spawned task.

use crate::config::PoolConfig;
use crate::dialects::ErrorListener;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionId, Dialect, ReplicaRole};
use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Creates, destroys and validates the connections a [`Pool`] manages.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Dialect whose fatal error codes apply to created connections.
    fn dialect(&self) -> Dialect;

    async fn create(&self, listener: ErrorListener) -> DbResult<Self::Connection>;

    async fn destroy(&self, connection: Self::Connection) -> DbResult<()>;

    fn validate(&self, connection: &Self::Connection) -> bool;
}

/// Pool-level failures. The connection manager translates these into [`DbError`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Timed out after {}ms waiting for a connection from pool '{pool}'", waited.as_millis())]
    Timeout { pool: String, waited: Duration },

    #[error("Pool '{pool}' is draining")]
    Draining { pool: String },

    #[error("Pool '{pool}' is closed")]
    Closed { pool: String },

    #[error("Connection {id} does not belong to pool '{pool}'")]
    ForeignConnection { id: ConnectionId, pool: String },

    #[error(transparent)]
    Factory(#[from] DbError),
}

/// Bookkeeping that travels with a connection between idle and loaned states.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    id: ConnectionId,
    pool_id: Uuid,
    role: Option<ReplicaRole>,
    created_at: Instant,
    uses: u32,
    listener: ErrorListener,
}

struct IdleConnection<T> {
    connection: T,
    meta: ConnectionMeta,
    idle_since: Instant,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub max: u32,
    pub min: u32,
    /// Connections that exist: idle, loaned or being created.
    pub size: usize,
    pub available: usize,
    pub using: usize,
    pub waiting: usize,
}

/// Return path for a connection whose holder dropped it without releasing.
trait Reclaim<T>: Send + Sync {
    fn reclaim(self: Arc<Self>, connection: T, meta: ConnectionMeta);
}

/// A connection on loan from a [`Pool`].
///
/// Hand it back with [`Pool::release`] or [`Pool::destroy`] (or the connection
/// manager equivalents). Dropping it instead destroys the connection.
pub struct PooledConnection<T: Send + 'static> {
    connection: Option<T>,
    meta: ConnectionMeta,
    permit: Option<OwnedSemaphorePermit>,
    home: Weak<dyn Reclaim<T>>,
}

impl<T: Send + 'static> PooledConnection<T> {
    pub fn id(&self) -> ConnectionId {
        self.meta.id
    }

    /// The replication sub-pool this connection was drawn from, if any.
    pub fn role(&self) -> Option<ReplicaRole> {
        self.meta.role
    }

    /// How many times this connection has been lent, including this loan.
    pub fn uses(&self) -> u32 {
        self.meta.uses
    }

    pub fn age(&self) -> Duration {
        self.meta.created_at.elapsed()
    }

    /// The error listener registered for this connection.
    pub fn listener(&self) -> &ErrorListener {
        &self.meta.listener
    }

    fn into_parts(mut self) -> Option<(T, ConnectionMeta, Option<OwnedSemaphorePermit>)> {
        let connection = self.connection.take()?;
        Some((connection, self.meta.clone(), self.permit.take()))
    }
}

impl<T: Send + 'static> std::ops::Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `into_parts` and `drop` empty the slot, and both consume the value.
        self.connection
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl<T: Send + 'static> std::ops::DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.connection
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl<T: Send + 'static> std::fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.meta.id)
            .field("role", &self.meta.role)
            .field("uses", &self.meta.uses)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        match self.home.upgrade() {
            Some(pool) => pool.reclaim(connection, self.meta.clone()),
            None => drop(connection),
        }
        // `permit` drops after this, freeing the slot.
    }
}

/// Decrements a counter when dropped, so cancelled futures keep counts honest.
struct CountGuard<'a> {
    count: &'a AtomicUsize,
    on_zero: Option<&'a Notify>,
}

impl<'a> CountGuard<'a> {
    fn enter(count: &'a AtomicUsize, on_zero: Option<&'a Notify>) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self { count, on_zero }
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            if let Some(notify) = self.on_zero {
                notify.notify_waiters();
            }
        }
    }
}

struct PoolInner<F: ConnectionFactory> {
    id: Uuid,
    name: String,
    role: Option<ReplicaRole>,
    config: PoolConfig,
    factory: F,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<F::Connection>>>,
    loaned: AtomicUsize,
    creating: AtomicUsize,
    waiting: AtomicUsize,
    /// Set by the first `acquire`; no connection opens before it.
    started: AtomicBool,
    draining: AtomicBool,
    closed: AtomicBool,
    /// Signalled when the last waiter leaves the queue.
    no_waiters: Notify,
    events: mpsc::UnboundedSender<ConnectionId>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// A bounded pool of connections produced by a [`ConnectionFactory`].
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
    /// Create a pool and start its maintenance task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        role: Option<ReplicaRole>,
        config: PoolConfig,
        factory: F,
    ) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let reap_interval = config.reap_interval;
        let inner = Arc::new(PoolInner {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            slots: Arc::new(Semaphore::new(config.max as usize)),
            config,
            factory,
            idle: Mutex::new(VecDeque::new()),
            loaned: AtomicUsize::new(0),
            creating: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            no_waiters: Notify::new(),
            events,
            maintenance: Mutex::new(None),
        });

        // Weak reference so the task never keeps a dropped pool alive
        let weak = Arc::downgrade(&inner);
        let handle = tokio::spawn(async move {
            maintenance_task(weak, event_rx, reap_interval).await;
        });
        *inner.maintenance.lock() = Some(handle);

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn role(&self) -> Option<ReplicaRole> {
        self.inner.role
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Borrow a connection, waiting up to `acquire_timeout` for a free slot and
    /// for the connection to be created if none is idle.
    pub async fn acquire(&self) -> Result<PooledConnection<F::Connection>, PoolError> {
        let inner = &self.inner;
        inner.ensure_accepting()?;
        inner.started.store(true, Ordering::Release);

        let started = Instant::now();
        let deadline = inner.config.acquire_timeout;

        let permit = {
            let _waiting = CountGuard::enter(&inner.waiting, Some(&inner.no_waiters));
            match tokio::time::timeout(deadline, Arc::clone(&inner.slots).acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(inner.closed_error()),
                Err(_) => {
                    debug!(pool = %inner.name, "Timed out waiting for a free slot");
                    return Err(PoolError::Timeout {
                        pool: inner.name.clone(),
                        waited: started.elapsed(),
                    });
                }
            }
        };

        if inner.closed.load(Ordering::Acquire) {
            return Err(inner.closed_error());
        }

        while let Some(entry) = inner.pop_idle() {
            if inner.is_lendable(&entry.connection, &entry.meta) {
                return Ok(self.lend(entry.connection, entry.meta, permit));
            }
            debug!(
                pool = %inner.name,
                connection_id = %entry.meta.id,
                "Discarding idle connection that failed validation"
            );
            let _ = inner.destroy_native(entry.connection, &entry.meta).await;
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        let (connection, meta) = inner.create(remaining, started).await?;
        Ok(self.lend(connection, meta, permit))
    }

    /// Return a connection to the idle set, or destroy it if it is no longer fit
    /// for reuse.
    pub async fn release(
        &self,
        pooled: PooledConnection<F::Connection>,
    ) -> Result<(), PoolError> {
        let inner = &self.inner;
        if pooled.meta.pool_id != inner.id {
            // Dropping it routes it back to its own pool.
            return Err(PoolError::ForeignConnection {
                id: pooled.id(),
                pool: inner.name.clone(),
            });
        }
        let Some((connection, meta, permit)) = pooled.into_parts() else {
            return Ok(());
        };
        inner.loaned.fetch_sub(1, Ordering::AcqRel);

        let retire_reason = if inner.closed.load(Ordering::Acquire) {
            Some("pool closed")
        } else if meta.listener.is_invalid() || !inner.factory.validate(&connection) {
            Some("connection invalid")
        } else if inner.config.max_uses.is_some_and(|max| meta.uses >= max) {
            Some("max uses reached")
        } else {
            None
        };

        match retire_reason {
            Some(reason) => {
                debug!(pool = %inner.name, connection_id = %meta.id, reason, "Retiring released connection");
                drop(permit);
                let _ = inner.destroy_native(connection, &meta).await;
            }
            None => {
                inner.idle.lock().push_back(IdleConnection {
                    connection,
                    meta,
                    idle_since: Instant::now(),
                });
                // Free the slot only once the connection is visible to the next waiter.
                drop(permit);
            }
        }
        Ok(())
    }

    /// Destroy a loaned connection instead of returning it.
    pub async fn destroy(
        &self,
        pooled: PooledConnection<F::Connection>,
    ) -> Result<(), PoolError> {
        let inner = &self.inner;
        if pooled.meta.pool_id != inner.id {
            return Err(PoolError::ForeignConnection {
                id: pooled.id(),
                pool: inner.name.clone(),
            });
        }
        let Some((connection, meta, permit)) = pooled.into_parts() else {
            return Ok(());
        };
        inner.loaned.fetch_sub(1, Ordering::AcqRel);
        drop(permit);
        inner
            .destroy_native(connection, &meta)
            .await
            .map_err(PoolError::Factory)
    }

    /// Stop accepting new acquisitions and wait until every queued acquirer has
    /// been served or has given up.
    pub async fn drain(&self) {
        let inner = &self.inner;
        inner.draining.store(true, Ordering::Release);
        loop {
            let notified = inner.no_waiters.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if inner.waiting.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
        debug!(pool = %inner.name, "Pool drained");
    }

    /// Destroy every idle connection now and stop background work. Connections
    /// still on loan are destroyed when they come back.
    pub async fn destroy_all_now(&self) {
        let inner = &self.inner;
        inner.draining.store(true, Ordering::Release);
        inner.closed.store(true, Ordering::Release);
        inner.slots.close();

        if let Some(handle) = inner.maintenance.lock().take() {
            handle.abort();
        }

        let victims: Vec<_> = inner.idle.lock().drain(..).collect();
        info!(pool = %inner.name, count = victims.len(), "Destroying all idle connections");
        // Close concurrently.
        join_all(
            victims
                .into_iter()
                .map(|victim| async move {
                    let _ = inner.destroy_native(victim.connection, &victim.meta).await;
                }),
        )
        .await;
    }

    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        let available = inner.idle.lock().len();
        let using = inner.loaned.load(Ordering::Acquire);
        PoolStatus {
            name: inner.name.clone(),
            max: inner.config.max,
            min: inner.config.min,
            size: available + using + inner.creating.load(Ordering::Acquire),
            available,
            using,
            waiting: inner.waiting.load(Ordering::Acquire),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn lend(
        &self,
        connection: F::Connection,
        mut meta: ConnectionMeta,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection<F::Connection> {
        meta.uses += 1;
        self.inner.loaned.fetch_add(1, Ordering::AcqRel);
        let home: Weak<dyn Reclaim<F::Connection>> = Arc::downgrade(&self.inner) as Weak<_>;
        PooledConnection {
            connection: Some(connection),
            meta,
            permit: Some(permit),
            home,
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("status", &self.status()).finish()
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn ensure_accepting(&self) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        if self.draining.load(Ordering::Acquire) {
            return Err(PoolError::Draining {
                pool: self.name.clone(),
            });
        }
        Ok(())
    }

    fn closed_error(&self) -> PoolError {
        PoolError::Closed {
            pool: self.name.clone(),
        }
    }

    fn pop_idle(&self) -> Option<IdleConnection<F::Connection>> {
        self.idle.lock().pop_back()
    }

    fn is_lendable(&self, connection: &F::Connection, meta: &ConnectionMeta) -> bool {
        if meta.listener.is_invalid() {
            return false;
        }
        !self.config.validate_on_borrow || self.factory.validate(connection)
    }

    fn total(&self) -> usize {
        self.idle.lock().len()
            + self.loaned.load(Ordering::Acquire)
            + self.creating.load(Ordering::Acquire)
    }

    async fn create(
        &self,
        within: Duration,
        started: Instant,
    ) -> Result<(F::Connection, ConnectionMeta), PoolError> {
        let id = ConnectionId::next();
        let listener = ErrorListener::new(id, self.factory.dialect(), self.events.clone());

        let result = {
            let _creating = CountGuard::enter(&self.creating, None);
            tokio::time::timeout(within, self.factory.create(listener.clone())).await
        };

        match result {
            Ok(Ok(connection)) => {
                debug!(pool = %self.name, connection_id = %id, "Created connection");
                let meta = ConnectionMeta {
                    id,
                    pool_id: self.id,
                    role: self.role,
                    created_at: Instant::now(),
                    uses: 0,
                    listener,
                };
                Ok((connection, meta))
            }
            Ok(Err(e)) => {
                debug!(pool = %self.name, error = %e, "Failed to create connection");
                Err(PoolError::Factory(e))
            }
            Err(_) => {
                debug!(pool = %self.name, "Timed out creating a connection");
                Err(PoolError::Timeout {
                    pool: self.name.clone(),
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Destroy a native connection, logging failures.
    async fn destroy_native(&self, connection: F::Connection, meta: &ConnectionMeta) -> DbResult<()> {
        match self.factory.destroy(connection).await {
            Ok(()) => {
                debug!(pool = %self.name, connection_id = %meta.id, "Destroyed connection");
                Ok(())
            }
            Err(e) => {
                warn!(
                    pool = %self.name,
                    connection_id = %meta.id,
                    error = %e,
                    "Failed to destroy connection"
                );
                Err(e)
            }
        }
    }

    /// Evict idle connections past `idle_timeout` while the pool is above `min`,
    /// and any idle connection that no longer validates.
    async fn reap(&self) {
        let now = Instant::now();
        let victims: Vec<IdleConnection<F::Connection>> = {
            let mut idle = self.idle.lock();
            let total = idle.len()
                + self.loaned.load(Ordering::Acquire)
                + self.creating.load(Ordering::Acquire);
            let mut surplus = total.saturating_sub(self.config.min as usize);
            let mut kept = VecDeque::with_capacity(idle.len());
            let mut victims = Vec::new();

            // Front of the queue has been idle longest.
            while let Some(entry) = idle.pop_front() {
                let dead = entry.meta.listener.is_invalid();
                let expired = now.saturating_duration_since(entry.idle_since)
                    >= self.config.idle_timeout;
                if dead || (expired && surplus > 0) {
                    surplus = surplus.saturating_sub(1);
                    victims.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *idle = kept;
            victims
        }; // Lock released here

        for victim in victims {
            debug!(
                pool = %self.name,
                connection_id = %victim.meta.id,
                "Evicting idle connection"
            );
            // Failures are logged in destroy_native; reaping continues regardless.
            let _ = self.destroy_native(victim.connection, &victim.meta).await;
        }
    }

    /// Open connections until the pool holds `min`, without exceeding `max`.
    /// Does nothing until the pool has been asked for a connection.
    async fn replenish(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        while !self.draining.load(Ordering::Acquire) && self.total() < self.config.min as usize {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                return;
            };
            let started = Instant::now();
            match self.create(self.config.acquire_timeout, started).await {
                Ok((connection, meta)) => {
                    self.idle.lock().push_back(IdleConnection {
                        connection,
                        meta,
                        idle_since: Instant::now(),
                    });
                    drop(permit);
                }
                Err(e) => {
                    warn!(pool = %self.name, error = %e, "Failed to open minimum connection");
                    return;
                }
            }
        }
    }

    /// Destroy an idle connection reported dead. Loaned ones are retired on release.
    async fn evict_broken(&self, id: ConnectionId) {
        let victim = {
            let mut idle = self.idle.lock();
            idle.iter()
                .position(|entry| entry.meta.id == id)
                .and_then(|index| idle.remove(index))
        };
        if let Some(victim) = victim {
            debug!(pool = %self.name, connection_id = %id, "Destroying idle connection after fatal error");
            let _ = self.destroy_native(victim.connection, &victim.meta).await;
        }
    }
}

impl<F: ConnectionFactory> Reclaim<F::Connection> for PoolInner<F> {
    fn reclaim(self: Arc<Self>, connection: F::Connection, meta: ConnectionMeta) {
        self.loaned.fetch_sub(1, Ordering::AcqRel);
        warn!(
            pool = %self.name,
            connection_id = %meta.id,
            "Connection dropped without release - consider using explicit release()"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = self.destroy_native(connection, &meta).await;
                });
            }
            Err(_) => drop(connection),
        }
    }
}

impl<F: ConnectionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.get_mut().take() {
            handle.abort();
        }
    }
}

/// Background task for eviction, refilling and fatal-error cleanup.
///
/// Uses a Weak reference to the pool to avoid keeping it alive.
/// The task exits when the pool is dropped or closed.
async fn maintenance_task<F: ConnectionFactory>(
    weak: Weak<PoolInner<F>>,
    mut events: mpsc::UnboundedReceiver<ConnectionId>,
    reap_interval: Duration,
) {
    let mut interval = tokio::time::interval(reap_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                inner.reap().await;
                inner.replenish().await;
            }
            event = events.recv() => {
                let Some(id) = event else {
                    return;
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.evict_broken(id).await;
            }
        }
    }
}
