//! SQLite connector.
//!
//! File databases get one native connection per pooled connection. An in-memory
//! database only lives as long as its connection, so every pooled connection of
//! one connector shares a single native connection; disconnecting a handle leaves
//! it open until [`SqliteConnector::release_shared`].

use super::{
    DialectConnector, ErrorListener, connect_within, describe_sqlx, io_error_code,
    native_from_sqlx, taxonomy,
};
use crate::error::{DbError, DbResult, NativeError};
use crate::models::{ConnectionId, ConnectionOptions, Dialect};
use async_trait::async_trait;
use sqlx::Connection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info};

const MEMORY: &str = ":memory:";

/// A native SQLite connection, possibly shared by several handles.
struct SqliteShared {
    connection: Mutex<Option<SqliteConnection>>,
    closed: AtomicBool,
}

impl SqliteShared {
    fn new(connection: SqliteConnection) -> Arc<Self> {
        Arc::new(Self {
            connection: Mutex::new(Some(connection)),
            closed: AtomicBool::new(false),
        })
    }

    async fn close(&self) -> DbResult<()> {
        self.closed.store(true, Ordering::Release);
        let taken = self.connection.lock().await.take();
        match taken {
            Some(connection) => connection
                .close()
                .await
                .map_err(|e| taxonomy::into_error(Dialect::Sqlite, native_from_sqlx(Dialect::Sqlite, e))),
            None => Ok(()),
        }
    }
}

/// A pooled SQLite connection.
pub struct SqliteHandle {
    shared: Arc<SqliteShared>,
    listener: ErrorListener,
    in_memory: bool,
    detached: AtomicBool,
}

impl SqliteHandle {
    pub fn id(&self) -> ConnectionId {
        self.listener.id()
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Whether this handle shares its native connection with `other`.
    pub fn shares_connection_with(&self, other: &SqliteHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn is_valid(&self) -> bool {
        !self.detached.load(Ordering::Acquire)
            && !self.shared.closed.load(Ordering::Acquire)
            && !self.listener.is_invalid()
    }

    /// Exclusive access to the native connection for a query.
    pub async fn native(&self) -> DbResult<MappedMutexGuard<'_, SqliteConnection>> {
        if self.detached.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }
        let guard = self.shared.connection.lock().await;
        MutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| self.closed_error())
    }

    /// Feed a driver error back to the pool. Returns true if the connection is
    /// now considered dead.
    pub fn report(&self, err: &sqlx::Error) -> bool {
        self.listener.report(&describe_sqlx(Dialect::Sqlite, err))
    }

    fn closed_error(&self) -> DbError {
        DbError::connection(NativeError::coded(
            "ECONNCLOSED",
            format!("connection {} is already closed", self.listener.id()),
        ))
    }
}

impl std::fmt::Debug for SqliteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteHandle")
            .field("id", &self.listener.id())
            .field("in_memory", &self.in_memory)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[derive(Default)]
pub struct SqliteConnector {
    /// The in-memory database shared by every handle of this connector.
    memory: Mutex<Option<Arc<SqliteShared>>>,
}

impl SqliteConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `storage`, else `host`, else in-memory.
    pub fn storage(options: &ConnectionOptions) -> &str {
        options
            .storage
            .as_deref()
            .or(options.host.as_deref())
            .unwrap_or(MEMORY)
    }

    fn is_memory(storage: &str) -> bool {
        storage == MEMORY || storage.is_empty()
    }

    /// Whether missing database files are created. Off for `mode: "readonly"`
    /// and `mode: "readwrite"`.
    fn creates_files(options: &ConnectionOptions) -> bool {
        !matches!(
            options.dialect_option_str("mode"),
            Some("readonly") | Some("readwrite")
        )
    }

    pub fn connect_options(options: &ConnectionOptions) -> DbResult<SqliteConnectOptions> {
        let storage = Self::storage(options);
        let base = if Self::is_memory(storage) {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                taxonomy::into_error(Dialect::Sqlite, native_from_sqlx(Dialect::Sqlite, e))
            })?
        } else {
            SqliteConnectOptions::new()
                .filename(storage)
                .create_if_missing(Self::creates_files(options))
                .read_only(options.dialect_option_str("mode") == Some("readonly"))
        };
        let foreign_keys = options.dialect_option_bool("foreign_keys").unwrap_or(true);
        Ok(base.foreign_keys(foreign_keys))
    }

    async fn open(options: &ConnectionOptions) -> DbResult<SqliteConnection> {
        let storage = Self::storage(options);
        if !Self::is_memory(storage) && Self::creates_files(options) {
            if let Some(parent) = Path::new(storage).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    let code = io_error_code(&e).map(String::from);
                    taxonomy::into_error(
                        Dialect::Sqlite,
                        NativeError::new(code, format!("cannot create {}: {}", parent.display(), e))
                            .with_source(e),
                    )
                })?;
            }
        }
        let connect_options = Self::connect_options(options)?;
        connect_within(Dialect::Sqlite, options, async {
            SqliteConnection::connect_with(&connect_options)
                .await
                .map_err(|e| native_from_sqlx(Dialect::Sqlite, e))
        })
        .await
    }

    /// Close the shared in-memory connection. Its data is gone afterwards; the
    /// next connect starts a fresh database.
    pub async fn release_shared(&self) -> DbResult<()> {
        let shared = self.memory.lock().await.take();
        match shared {
            Some(shared) => {
                info!("Closing shared in-memory SQLite connection");
                shared.close().await
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SqliteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl DialectConnector for SqliteConnector {
    type Connection = SqliteHandle;

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn connect(
        &self,
        options: &ConnectionOptions,
        listener: ErrorListener,
    ) -> DbResult<SqliteHandle> {
        let in_memory = Self::is_memory(Self::storage(options));
        let shared = if in_memory {
            let mut memory = self.memory.lock().await;
            match memory.as_ref().filter(|s| !s.closed.load(Ordering::Acquire)) {
                Some(shared) => Arc::clone(shared),
                None => {
                    let shared = SqliteShared::new(Self::open(options).await?);
                    *memory = Some(Arc::clone(&shared));
                    shared
                }
            }
        } else {
            SqliteShared::new(Self::open(options).await?)
        };

        debug!(
            connection_id = %listener.id(),
            storage = Self::storage(options),
            "Opened SQLite connection"
        );
        Ok(SqliteHandle {
            shared,
            listener,
            in_memory,
            detached: AtomicBool::new(false),
        })
    }

    async fn disconnect(&self, connection: &mut SqliteHandle) -> DbResult<()> {
        if connection.detached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if connection.in_memory {
            // The shared database stays open for the other handles.
            return Ok(());
        }
        connection.shared.close().await
    }

    fn validate(&self, connection: &SqliteHandle) -> bool {
        connection.is_valid()
    }

    async fn database_version(&self, connection: &mut SqliteHandle) -> DbResult<String> {
        let result = {
            let mut native = connection.native().await?;
            sqlx::query_scalar::<_, String>("SELECT sqlite_version()")
                .fetch_one(&mut *native)
                .await
        };
        result.map_err(|e| {
            connection.report(&e);
            taxonomy::into_error(Dialect::Sqlite, native_from_sqlx(Dialect::Sqlite, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_storage_precedence() {
        let memory = ConnectionOptions::default();
        assert_eq!(SqliteConnector::storage(&memory), ":memory:");

        let host = ConnectionOptions {
            host: Some("app.db".into()),
            ..Default::default()
        };
        assert_eq!(SqliteConnector::storage(&host), "app.db");

        let both = ConnectionOptions {
            host: Some("ignored.db".into()),
            storage: Some("data.db".into()),
            ..Default::default()
        };
        assert_eq!(SqliteConnector::storage(&both), "data.db");
    }

    async fn foreign_keys_pragma(options: &ConnectionOptions) -> i64 {
        let connector = SqliteConnector::new();
        let handle = connector
            .connect(options, ErrorListener::detached(Dialect::Sqlite))
            .await
            .unwrap();
        let mut native = handle.native().await.unwrap();
        sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys")
            .fetch_one(&mut *native)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_foreign_keys_on_by_default() {
        assert_eq!(foreign_keys_pragma(&ConnectionOptions::default()).await, 1);

        let opted_out = ConnectionOptions {
            dialect_options: json!({"foreign_keys": false}).as_object().cloned(),
            ..Default::default()
        };
        assert_eq!(foreign_keys_pragma(&opted_out).await, 0);
    }

    #[tokio::test]
    async fn test_memory_connections_are_shared() {
        let connector = SqliteConnector::new();
        let options = ConnectionOptions::default();
        let mut first = connector
            .connect(&options, ErrorListener::detached(Dialect::Sqlite))
            .await
            .unwrap();
        let second = connector
            .connect(&options, ErrorListener::detached(Dialect::Sqlite))
            .await
            .unwrap();
        assert!(first.shares_connection_with(&second));

        connector.disconnect(&mut first).await.unwrap();
        assert!(!connector.validate(&first));
        assert!(connector.validate(&second));

        connector.release_shared().await.unwrap();
        assert!(!connector.validate(&second));
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let options = ConnectionOptions {
            storage: Some(dir.path().join("twice.db").display().to_string()),
            ..Default::default()
        };
        let connector = SqliteConnector::new();
        let mut handle = connector
            .connect(&options, ErrorListener::detached(Dialect::Sqlite))
            .await
            .unwrap();
        connector.disconnect(&mut handle).await.unwrap();
        connector.disconnect(&mut handle).await.unwrap();
        assert!(handle.native().await.is_err());
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/app.db");
        let options = ConnectionOptions {
            storage: Some(path.display().to_string()),
            ..Default::default()
        };
        let connector = SqliteConnector::new();
        let mut handle = connector
            .connect(&options, ErrorListener::detached(Dialect::Sqlite))
            .await
            .unwrap();
        assert!(path.exists());
        let version = connector.database_version(&mut handle).await.unwrap();
        assert!(version.starts_with('3'));
        connector.disconnect(&mut handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_in_readwrite_mode_is_invalid_connection() {
        let dir = tempfile::tempdir().unwrap();
        let options = ConnectionOptions {
            storage: Some(dir.path().join("absent.db").display().to_string()),
            dialect_options: json!({"mode": "readwrite"}).as_object().cloned(),
            ..Default::default()
        };
        let err = SqliteConnector::new()
            .connect(&options, ErrorListener::detached(Dialect::Sqlite))
            .await
            .unwrap_err();
        assert!(
            matches!(err, DbError::InvalidConnectionParameters(_)),
            "unexpected error: {err}"
        );
    }
}
