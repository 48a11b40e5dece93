//! Oracle connector using the `oracle` crate (ODPI-C).
//!
//! ODPI-C calls block, so every call runs on Tokio's blocking pool.

use super::{DialectConnector, ErrorListener, connect_within, taxonomy};
use crate::error::{DbError, DbResult, NativeError};
use crate::models::{ConnectionId, ConnectionOptions, Dialect};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Oracle reports errors as `ORA-01017: invalid username/password`; the prefix is
/// the code.
fn native_from_oracle(err: oracle::Error) -> NativeError {
    let message = err.to_string();
    let code = message
        .split_once(':')
        .map(|(prefix, _)| prefix.trim())
        .filter(|prefix| {
            ["ORA-", "DPI-", "NJS-", "TNS-"]
                .iter()
                .any(|family| prefix.starts_with(family))
        })
        .map(String::from);
    NativeError::new(code, message).with_source(err)
}

fn join_failed(err: tokio::task::JoinError) -> DbError {
    DbError::internal(format!("blocking Oracle call failed: {}", err))
}

pub struct OracleConnection {
    inner: Arc<Mutex<Option<oracle::Connection>>>,
    closed: AtomicBool,
    listener: ErrorListener,
}

impl OracleConnection {
    pub fn id(&self) -> ConnectionId {
        self.listener.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_valid(&self) -> bool {
        !self.is_closed() && !self.listener.is_invalid()
    }

    /// Run a blocking call against the native connection. Driver errors are
    /// reported to the pool before being classified.
    pub async fn run<R, F>(&self, call: F) -> DbResult<R>
    where
        F: FnOnce(&oracle::Connection) -> Result<R, oracle::Error> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let outcome = tokio::task::spawn_blocking(move || {
            let guard = inner.lock();
            guard.as_ref().map(call)
        })
        .await
        .map_err(join_failed)?;

        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => {
                let native = native_from_oracle(e);
                self.listener.report(&native);
                Err(taxonomy::into_error(Dialect::Oracle, native))
            }
            None => Err(DbError::connection(NativeError::coded(
                "ECONNCLOSED",
                format!("connection {} is already closed", self.listener.id()),
            ))),
        }
    }

    async fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let result = tokio::task::spawn_blocking(move || inner.lock().take().map(|c| c.close()))
            .await
            .map_err(join_failed)?;
        match result {
            Some(Err(e)) => Err(taxonomy::into_error(Dialect::Oracle, native_from_oracle(e))),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for OracleConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleConnection")
            .field("id", &self.listener.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OracleConnector;

impl OracleConnector {
    pub fn new() -> Self {
        Self
    }

    /// `dialect_options.connect_string` if given, else `host:port/database`.
    pub fn connect_string(options: &ConnectionOptions) -> String {
        if let Some(connect_string) = options.dialect_option_str("connect_string") {
            return connect_string.to_string();
        }
        let mut connect_string = format!(
            "{}:{}",
            options.host_or_default(),
            options.port_or_default(Dialect::Oracle).unwrap_or(1521)
        );
        if let Some(database) = &options.database {
            connect_string.push('/');
            connect_string.push_str(database);
        }
        connect_string
    }
}

#[async_trait]
impl DialectConnector for OracleConnector {
    type Connection = OracleConnection;

    fn dialect(&self) -> Dialect {
        Dialect::Oracle
    }

    async fn connect(
        &self,
        options: &ConnectionOptions,
        listener: ErrorListener,
    ) -> DbResult<OracleConnection> {
        let username = options.username.clone().unwrap_or_default();
        let password = options.password.clone().unwrap_or_default();
        let connect_string = Self::connect_string(options);

        let attempt = async move {
            tokio::task::spawn_blocking(move || {
                oracle::Connection::connect(&username, &password, &connect_string)
            })
            .await
            .map_err(|e| NativeError::uncoded(e.to_string()))?
            .map_err(native_from_oracle)
        };
        let native = connect_within(Dialect::Oracle, options, attempt).await?;

        debug!(connection_id = %listener.id(), endpoint = %options.endpoint_label(), "Connected to Oracle");
        Ok(OracleConnection {
            inner: Arc::new(Mutex::new(Some(native))),
            closed: AtomicBool::new(false),
            listener,
        })
    }

    async fn disconnect(&self, connection: &mut OracleConnection) -> DbResult<()> {
        connection.close().await
    }

    fn validate(&self, connection: &OracleConnection) -> bool {
        connection.is_valid()
    }

    async fn database_version(&self, connection: &mut OracleConnection) -> DbResult<String> {
        connection
            .run(|native| native.server_version().map(|(version, _banner)| version.to_string()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_string() {
        let options = ConnectionOptions {
            host: Some("ora.local".into()),
            database: Some("XEPDB1".into()),
            ..Default::default()
        };
        assert_eq!(OracleConnector::connect_string(&options), "ora.local:1521/XEPDB1");
    }

    #[test]
    fn test_prefix_codes_feed_the_tables() {
        let native = NativeError::uncoded("ORA-12541: TNS:no listener");
        assert_eq!(
            taxonomy::classify(Dialect::Oracle, &native),
            crate::error::ConnectionErrorKind::HostNotReachable
        );
    }
}
