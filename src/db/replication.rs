//! Read/write pool topology.
//!
//! With replication configured the manager owns two pools. Connections carry the
//! role of the pool that lent them, and release/destroy follow that tag back.

use super::pool::{ConnectionFactory, Pool, PoolError, PoolStatus, PooledConnection};
use crate::models::{AcquireOptions, ReplicaRole};
use serde::Serialize;

/// A read pool and a write pool.
pub struct ReplicatedPool<F: ConnectionFactory> {
    read: Pool<F>,
    write: Pool<F>,
}

impl<F: ConnectionFactory> ReplicatedPool<F> {
    pub fn new(read: Pool<F>, write: Pool<F>) -> Self {
        Self { read, write }
    }

    pub fn read(&self) -> &Pool<F> {
        &self.read
    }

    pub fn write(&self) -> &Pool<F> {
        &self.write
    }

    fn pool_for(&self, role: Option<ReplicaRole>) -> &Pool<F> {
        match role {
            Some(ReplicaRole::Read) => &self.read,
            _ => &self.write,
        }
    }

    pub async fn acquire(
        &self,
        options: AcquireOptions,
    ) -> Result<PooledConnection<F::Connection>, PoolError> {
        if options.is_replica_eligible() {
            self.read.acquire().await
        } else {
            self.write.acquire().await
        }
    }

    pub async fn release(&self, connection: PooledConnection<F::Connection>) -> Result<(), PoolError> {
        self.pool_for(connection.role()).release(connection).await
    }

    pub async fn destroy(&self, connection: PooledConnection<F::Connection>) -> Result<(), PoolError> {
        self.pool_for(connection.role()).destroy(connection).await
    }

    pub async fn drain(&self) {
        tokio::join!(self.read.drain(), self.write.drain());
    }

    pub async fn destroy_all_now(&self) {
        tokio::join!(self.read.destroy_all_now(), self.write.destroy_all_now());
    }
}

/// The pools behind a connection manager.
pub enum PoolTopology<F: ConnectionFactory> {
    Single(Pool<F>),
    Replicated(ReplicatedPool<F>),
}

/// Occupancy of every pool in a [`PoolTopology`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "topology", rename_all = "lowercase")]
pub enum TopologyStatus {
    Single { pool: PoolStatus },
    Replicated { read: PoolStatus, write: PoolStatus },
}

impl TopologyStatus {
    /// Connections on loan across all pools.
    pub fn using(&self) -> usize {
        match self {
            TopologyStatus::Single { pool } => pool.using,
            TopologyStatus::Replicated { read, write } => read.using + write.using,
        }
    }
}

impl<F: ConnectionFactory> PoolTopology<F> {
    pub fn is_replicated(&self) -> bool {
        matches!(self, PoolTopology::Replicated(_))
    }

    pub async fn acquire(
        &self,
        options: AcquireOptions,
    ) -> Result<PooledConnection<F::Connection>, PoolError> {
        match self {
            PoolTopology::Single(pool) => pool.acquire().await,
            PoolTopology::Replicated(pools) => pools.acquire(options).await,
        }
    }

    pub async fn release(&self, connection: PooledConnection<F::Connection>) -> Result<(), PoolError> {
        match self {
            PoolTopology::Single(pool) => pool.release(connection).await,
            PoolTopology::Replicated(pools) => pools.release(connection).await,
        }
    }

    pub async fn destroy(&self, connection: PooledConnection<F::Connection>) -> Result<(), PoolError> {
        match self {
            PoolTopology::Single(pool) => pool.destroy(connection).await,
            PoolTopology::Replicated(pools) => pools.destroy(connection).await,
        }
    }

    pub async fn drain(&self) {
        match self {
            PoolTopology::Single(pool) => pool.drain().await,
            PoolTopology::Replicated(pools) => pools.drain().await,
        }
    }

    pub async fn destroy_all_now(&self) {
        match self {
            PoolTopology::Single(pool) => pool.destroy_all_now().await,
            PoolTopology::Replicated(pools) => pools.destroy_all_now().await,
        }
    }

    pub fn status(&self) -> TopologyStatus {
        match self {
            PoolTopology::Single(pool) => TopologyStatus::Single {
                pool: pool.status(),
            },
            PoolTopology::Replicated(pools) => TopologyStatus::Replicated {
                read: pools.read.status(),
                write: pools.write.status(),
            },
        }
    }
}
