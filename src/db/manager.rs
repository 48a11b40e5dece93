//! Connection manager: pools, replication routing and version resolution on top
//! of a [`DialectConnector`].
//!
//! # Design Decisions
//!
//! - **Composition over an injected connector**: the manager owns pooling and
//!   routing; the connector only opens, closes and validates native connections.
//! - **Single-flight version probe**: `tokio::sync::OnceCell::get_or_try_init`
//!   runs one probe no matter how many callers race. A failed probe leaves the
//!   cell empty, so the next caller probes again.
//! - **Round-robin read replicas**: the read pool's factory picks the next
//!   replica for every connection it creates.

use super::hooks::{ConnectionHooks, NoHooks};
use super::pool::{ConnectionFactory, Pool, PoolError, PooledConnection};
use super::replication::{PoolTopology, ReplicatedPool, TopologyStatus};
use super::type_parser::{DataTypeDescriptor, TypeParser, TypeParserRegistry};
use super::version::DatabaseVersion;
use crate::config::ManagerConfig;
use crate::dialects::{DialectConnector, ErrorListener};
use crate::error::{DbError, DbResult, NativeError};
use crate::models::{AcquireOptions, ConnectionOptions, Dialect, ReplicaRole};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Where a pool's factory opens its connections.
enum Endpoints {
    Single(ConnectionOptions),
    RoundRobin {
        replicas: Vec<ConnectionOptions>,
        next: AtomicUsize,
    },
}

impl Endpoints {
    fn next(&self) -> &ConnectionOptions {
        match self {
            Endpoints::Single(options) => options,
            Endpoints::RoundRobin { replicas, next } => {
                let index = next.fetch_add(1, Ordering::Relaxed) % replicas.len();
                &replicas[index]
            }
        }
    }
}

/// Connection factory the manager gives each pool.
pub struct ManagedFactory<C: DialectConnector> {
    connector: Arc<C>,
    hooks: Arc<dyn ConnectionHooks<C::Connection>>,
    endpoints: Endpoints,
}

#[async_trait]
impl<C: DialectConnector> ConnectionFactory for ManagedFactory<C> {
    type Connection = C::Connection;

    fn dialect(&self) -> Dialect {
        self.connector.dialect()
    }

    async fn create(&self, listener: ErrorListener) -> DbResult<C::Connection> {
        open(&*self.connector, &*self.hooks, self.endpoints.next(), listener).await
    }

    async fn destroy(&self, mut connection: C::Connection) -> DbResult<()> {
        close(&*self.connector, &*self.hooks, &mut connection).await
    }

    fn validate(&self, connection: &C::Connection) -> bool {
        self.connector.validate(connection)
    }
}

/// Open a native connection with the connect hooks applied.
async fn open<C: DialectConnector>(
    connector: &C,
    hooks: &dyn ConnectionHooks<C::Connection>,
    endpoint: &ConnectionOptions,
    listener: ErrorListener,
) -> DbResult<C::Connection> {
    let mut options = endpoint.clone();
    hooks.before_connect(&mut options).await?;
    let mut connection = connector.connect(&options, listener).await?;
    if let Err(e) = hooks.after_connect(&mut connection, &options).await {
        if let Err(close_err) = connector.disconnect(&mut connection).await {
            warn!(error = %close_err, "Failed to close connection rejected by after_connect hook");
        }
        return Err(e);
    }
    Ok(connection)
}

/// Close a native connection with the disconnect hooks applied.
async fn close<C: DialectConnector>(
    connector: &C,
    hooks: &dyn ConnectionHooks<C::Connection>,
    connection: &mut C::Connection,
) -> DbResult<()> {
    hooks.before_disconnect(connection).await?;
    connector.disconnect(connection).await?;
    hooks.after_disconnect(connection).await
}

/// Pooled, optionally replicated access to one database.
pub struct ConnectionManager<C: DialectConnector> {
    connector: Arc<C>,
    hooks: Arc<dyn ConnectionHooks<C::Connection>>,
    config: ManagerConfig,
    pools: PoolTopology<ManagedFactory<C>>,
    version: OnceCell<DatabaseVersion>,
    closed: AtomicBool,
    type_parsers: RwLock<TypeParserRegistry>,
}

impl<C: DialectConnector> ConnectionManager<C> {
    /// Build a manager and its pools. Must be called from within a Tokio runtime.
    pub fn new(connector: C, config: ManagerConfig) -> DbResult<Self> {
        Self::with_hooks(connector, config, Arc::new(NoHooks))
    }

    pub fn with_hooks(
        connector: C,
        config: ManagerConfig,
        hooks: Arc<dyn ConnectionHooks<C::Connection>>,
    ) -> DbResult<Self> {
        config
            .validate()
            .map_err(|e| DbError::invalid_config(e.to_string()))?;
        let dialect = connector.dialect();
        if config.dialect != dialect {
            return Err(DbError::invalid_config(format!(
                "configuration is for {} but the connector speaks {}",
                config.dialect, dialect
            )));
        }

        let connector = Arc::new(connector);
        let pool_config = config.pool.to_config();
        let factory = |endpoints: Endpoints| ManagedFactory {
            connector: Arc::clone(&connector),
            hooks: Arc::clone(&hooks),
            endpoints,
        };

        let pools = match &config.replication {
            None => PoolTopology::Single(Pool::new(
                format!("{}:pool", dialect),
                None,
                pool_config,
                factory(Endpoints::Single(config.connection.clone())),
            )),
            Some(replication) => {
                let resolved = replication.resolve(&config.connection);
                debug!(
                    dialect = %dialect,
                    replicas = resolved.read.len(),
                    "Creating replicated pools"
                );
                let read = Pool::new(
                    format!("{}:read", dialect),
                    Some(ReplicaRole::Read),
                    pool_config.clone(),
                    factory(Endpoints::RoundRobin {
                        replicas: resolved.read,
                        next: AtomicUsize::new(0),
                    }),
                );
                let write = Pool::new(
                    format!("{}:write", dialect),
                    Some(ReplicaRole::Write),
                    pool_config,
                    factory(Endpoints::Single(resolved.write)),
                );
                PoolTopology::Replicated(ReplicatedPool::new(read, write))
            }
        };

        let version = OnceCell::new_with(config.database_version.as_deref().map(DatabaseVersion::parse));

        Ok(Self {
            connector,
            hooks,
            pools,
            version,
            closed: AtomicBool::new(false),
            type_parsers: RwLock::new(TypeParserRegistry::new(dialect)),
            config,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.connector.dialect()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Borrow a connection.
    ///
    /// Reads go to the read pool unless `use_master` is set; everything else goes
    /// to the write pool. The first call resolves the server version.
    pub async fn get_connection(
        &self,
        options: AcquireOptions,
    ) -> DbResult<PooledConnection<C::Connection>> {
        self.ensure_open()?;
        self.resolve_version().await?;
        self.ensure_open()?;

        self.hooks.before_pool_acquire(&options).await?;
        let mut connection = self
            .pools
            .acquire(options)
            .await
            .map_err(|e| self.map_pool_error(e))?;

        if let Err(e) = self.hooks.after_pool_acquire(&mut connection, &options).await {
            if let Err(release_err) = self.pools.release(connection).await {
                warn!(error = %release_err, "Failed to release connection rejected by after_pool_acquire hook");
            }
            return Err(e);
        }
        Ok(connection)
    }

    /// Return a connection to the pool it came from.
    pub async fn release_connection(&self, connection: PooledConnection<C::Connection>) -> DbResult<()> {
        self.pools
            .release(connection)
            .await
            .map_err(|e| self.map_pool_error(e))
    }

    /// Close a connection instead of returning it to its pool.
    pub async fn destroy_connection(&self, connection: PooledConnection<C::Connection>) -> DbResult<()> {
        self.pools
            .destroy(connection)
            .await
            .map_err(|e| self.map_pool_error(e))
    }

    /// Report a driver error seen while using `connection`. Returns true if the
    /// connection is now dead and will be destroyed instead of reused.
    pub fn report_error(
        &self,
        connection: &PooledConnection<C::Connection>,
        code: &str,
        message: &str,
    ) -> bool {
        connection
            .listener()
            .report(&NativeError::coded(code, message))
    }

    /// Stop lending, wait for queued acquirers, then close every idle connection.
    /// Calling it again does nothing.
    pub async fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(dialect = %self.dialect(), "Closing connection manager");
        self.pools.drain().await;
        self.pools.destroy_all_now().await;
        Ok(())
    }

    /// The resolved server version, once known.
    pub fn database_version(&self) -> Option<&DatabaseVersion> {
        self.version.get()
    }

    pub fn pool_status(&self) -> TopologyStatus {
        self.pools.status()
    }

    /// Register parsers for every descriptor that supports this dialect.
    pub fn refresh_type_parser(&self, descriptors: &[DataTypeDescriptor]) -> DbResult<()> {
        self.type_parsers.write().refresh(descriptors)
    }

    pub fn type_parser(&self, native_type: &str) -> Option<TypeParser> {
        self.type_parsers.read().get(native_type)
    }

    /// Parse a raw value with the parser registered for `native_type`.
    pub fn parse_value(&self, native_type: &str, raw: &str) -> Option<Value> {
        self.type_parsers.read().parse(native_type, raw)
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::ManagerClosed);
        }
        Ok(())
    }

    async fn resolve_version(&self) -> DbResult<&DatabaseVersion> {
        self.version.get_or_try_init(|| self.probe_version()).await
    }

    /// Open an unpooled connection to ask the server for its version.
    async fn probe_version(&self) -> DbResult<DatabaseVersion> {
        let dialect = self.dialect();
        let endpoint = self.config.probe_endpoint();
        debug!(dialect = %dialect, endpoint = %endpoint.endpoint_label(), "Probing database version");

        let mut connection = open(
            &*self.connector,
            &*self.hooks,
            &endpoint,
            ErrorListener::detached(dialect),
        )
        .await?;
        let reported = self.connector.database_version(&mut connection).await;
        if let Err(e) = close(&*self.connector, &*self.hooks, &mut connection).await {
            warn!(dialect = %dialect, error = %e, "Failed to close version probe connection");
        }

        let version = DatabaseVersion::parse(reported?);
        let minimum = dialect.minimum_version();
        if version.is_below(minimum) {
            warn!(
                dialect = %dialect,
                version = %version,
                minimum,
                "Database version is older than the oldest supported version"
            );
        }
        info!(dialect = %dialect, version = %version, "Resolved database version");
        Ok(version)
    }

    fn map_pool_error(&self, err: PoolError) -> DbError {
        match err {
            PoolError::Timeout { pool, waited } => {
                DbError::acquire_timeout(pool, waited.as_millis() as u64)
            }
            PoolError::Draining { .. } | PoolError::Closed { .. } if self.is_closed() => {
                DbError::ManagerClosed
            }
            PoolError::Draining { pool } => DbError::pool_unavailable(pool, "draining"),
            PoolError::Closed { pool } => DbError::pool_unavailable(pool, "closed"),
            PoolError::ForeignConnection { .. } => DbError::internal(err.to_string()),
            PoolError::Factory(e) => e,
        }
    }
}

impl<C: DialectConnector> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("dialect", &self.dialect())
            .field("closed", &self.is_closed())
            .field("version", &self.version.get())
            .field("pools", &self.pools.status())
            .finish()
    }
}
