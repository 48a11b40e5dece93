//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use db_connection_manager::config::{ManagerConfig, PoolOptions};
use db_connection_manager::dialects::{DialectConnector, ErrorListener};
use db_connection_manager::error::{DbError, DbResult, NativeError};
use db_connection_manager::models::{ConnectionId, ConnectionOptions, Dialect};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// A connection handed out by [`MockConnector`].
#[derive(Debug)]
pub struct MockConnection {
    pub serial: usize,
    pub host: String,
    pub listener: ErrorListener,
    pub open: bool,
}

impl MockConnection {
    pub fn id(&self) -> ConnectionId {
        self.listener.id()
    }
}

/// In-process connector that records what the manager asks of it.
pub struct MockConnector {
    dialect: Dialect,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub version_queries: AtomicUsize,
    /// Host of every connect, in order.
    pub hosts: Mutex<Vec<String>>,
    pub connect_delay: Mutex<Duration>,
    pub probe_delay: Mutex<Duration>,
    pub version: Mutex<String>,
    /// Error code the next connects fail with, if set.
    pub fail_with: Mutex<Option<String>>,
    pub fail_version: AtomicBool,
}

impl MockConnector {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            version_queries: AtomicUsize::new(0),
            hosts: Mutex::new(Vec::new()),
            connect_delay: Mutex::new(Duration::ZERO),
            probe_delay: Mutex::new(Duration::ZERO),
            version: Mutex::new("8.0.36".to_string()),
            fail_with: Mutex::new(None),
            fail_version: AtomicBool::new(false),
        }
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.connect_delay.lock() = delay;
        self
    }

    pub fn with_probe_delay(self, delay: Duration) -> Self {
        *self.probe_delay.lock() = delay;
        self
    }

    pub fn with_version(self, version: &str) -> Self {
        *self.version.lock() = version.to_string();
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn version_queries(&self) -> usize {
        self.version_queries.load(Ordering::SeqCst)
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().clone()
    }
}

#[async_trait]
impl DialectConnector for MockConnector {
    type Connection = MockConnection;

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn connect(
        &self,
        options: &ConnectionOptions,
        listener: ErrorListener,
    ) -> DbResult<MockConnection> {
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.fail_with.lock().clone();
        if let Some(code) = failure {
            let native = NativeError::coded(code, "mock connect failure");
            return Err(db_connection_manager::dialects::taxonomy::into_error(
                self.dialect,
                native,
            ));
        }
        let serial = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let host = options.host_or_default().to_string();
        self.hosts.lock().push(host.clone());
        Ok(MockConnection {
            serial,
            host,
            listener,
            open: true,
        })
    }

    async fn disconnect(&self, connection: &mut MockConnection) -> DbResult<()> {
        if connection.open {
            connection.open = false;
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn validate(&self, connection: &MockConnection) -> bool {
        connection.open && !connection.listener.is_invalid()
    }

    async fn database_version(&self, _connection: &mut MockConnection) -> DbResult<String> {
        self.version_queries.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_version.load(Ordering::SeqCst) {
            return Err(DbError::connection(NativeError::coded(
                "ECONNRESET",
                "mock version query failed",
            )));
        }
        Ok(self.version.lock().clone())
    }
}

pub fn endpoint(host: &str) -> ConnectionOptions {
    ConnectionOptions {
        host: Some(host.to_string()),
        username: Some("app".to_string()),
        database: Some("main".to_string()),
        ..Default::default()
    }
}

pub fn pool_options(max: u32, acquire_ms: u64) -> PoolOptions {
    PoolOptions {
        max: Some(max),
        min: Some(0),
        acquire: Some(acquire_ms),
        ..Default::default()
    }
}

/// Single-pool MySQL config with a preset version so no probe runs.
pub fn mysql_config(max: u32, acquire_ms: u64) -> ManagerConfig {
    ManagerConfig::new(Dialect::Mysql, endpoint("primary"))
        .with_pool(pool_options(max, acquire_ms))
        .with_database_version("8.0.36")
}

pub fn env_url(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(url) if !url.is_empty() => Some(url),
        _ => {
            eprintln!("Skipping test: {} not set", name);
            None
        }
    }
}
