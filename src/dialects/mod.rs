//! Dialect connectors.
//!
//! A [`DialectConnector`] opens, closes and validates native connections for one
//! backend. Connectors know nothing about pooling: the pool hands each new
//! connection an [`ErrorListener`] and the connector reports fatal driver errors
//! through it.
//!
//! - `postgres`, `mysql`, `mariadb`, `sqlite`: sqlx single connections
//! - `mssql`: tiberius, behind the `mssql` feature
//! - `oracle`: the `oracle` crate, behind the `oracle` feature
//! - `registry`: static name → connector lookup ([`AnyConnector`])

use crate::error::{DbError, DbResult, NativeError};
use crate::models::{ConnectionId, ConnectionOptions, Dialect};
use async_trait::async_trait;
use chrono::FixedOffset;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

pub mod mariadb;
#[cfg(feature = "mssql")]
pub mod mssql;
pub mod mysql;
#[cfg(feature = "oracle")]
pub mod oracle;
pub mod postgres;
pub mod registry;
pub mod sqlite;
pub mod taxonomy;

pub use mariadb::MariaDbConnector;
#[cfg(feature = "mssql")]
pub use mssql::{MssqlConnection, MssqlConnector, MssqlSession};
pub use mysql::{MySqlConnection, MySqlConnector};
#[cfg(feature = "oracle")]
pub use self::oracle::{OracleConnection, OracleConnector};
pub use postgres::{PostgresConnection, PostgresConnector};
pub use registry::{AnyConnection, AnyConnector};
pub use sqlite::{SqliteConnector, SqliteHandle};

/// Opens, closes and validates native connections for one backend.
#[async_trait]
pub trait DialectConnector: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn dialect(&self) -> Dialect;

    /// Open a native connection and run any post-connect session setup.
    ///
    /// Failures are mapped into the connection error taxonomy. The connector keeps
    /// `listener` with the connection and reports fatal driver errors through it.
    async fn connect(
        &self,
        options: &ConnectionOptions,
        listener: ErrorListener,
    ) -> DbResult<Self::Connection>;

    /// Close a connection. Closing an already closed connection is a no-op.
    async fn disconnect(&self, connection: &mut Self::Connection) -> DbResult<()>;

    /// Cheap liveness check from driver state. Never touches the network.
    fn validate(&self, connection: &Self::Connection) -> bool;

    /// Ask the server for its version string.
    async fn database_version(&self, connection: &mut Self::Connection) -> DbResult<String>;
}

struct ListenerState {
    id: ConnectionId,
    dialect: Dialect,
    invalid: AtomicBool,
    sink: Option<mpsc::UnboundedSender<ConnectionId>>,
}

/// Per-connection error hook shared between a connection and its pool.
///
/// Reporting a fatal code marks the connection invalid, so `validate` fails from
/// then on, and tells the owning pool to destroy it.
#[derive(Clone)]
pub struct ErrorListener {
    state: Arc<ListenerState>,
}

impl ErrorListener {
    pub fn new(
        id: ConnectionId,
        dialect: Dialect,
        sink: mpsc::UnboundedSender<ConnectionId>,
    ) -> Self {
        Self {
            state: Arc::new(ListenerState {
                id,
                dialect,
                invalid: AtomicBool::new(false),
                sink: Some(sink),
            }),
        }
    }

    /// Listener for a connection no pool owns, such as the version probe.
    pub fn detached(dialect: Dialect) -> Self {
        Self {
            state: Arc::new(ListenerState {
                id: ConnectionId::next(),
                dialect,
                invalid: AtomicBool::new(false),
                sink: None,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.state.id
    }

    pub fn dialect(&self) -> Dialect {
        self.state.dialect
    }

    /// Report a driver error. Returns true if it was fatal for the connection.
    pub fn report(&self, native: &NativeError) -> bool {
        let fatal = native
            .code()
            .is_some_and(|code| taxonomy::is_fatal(self.state.dialect, code));
        if fatal {
            warn!(
                connection_id = %self.state.id,
                dialect = %self.state.dialect,
                error = %native,
                "Fatal connection error, scheduling destroy"
            );
            self.invalidate();
        }
        fatal
    }

    /// Mark the connection dead and notify the owning pool once.
    pub fn invalidate(&self) {
        if self.state.invalid.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sink) = &self.state.sink {
            // The pool may already be gone; the invalid flag still fails validation.
            let _ = sink.send(self.state.id);
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.state.invalid.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ErrorListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorListener")
            .field("id", &self.state.id)
            .field("dialect", &self.state.dialect)
            .field("invalid", &self.is_invalid())
            .finish()
    }
}

/// Run a native connect attempt under the configured connect timeout and map
/// any failure into the taxonomy.
pub(crate) async fn connect_within<T, F>(
    dialect: Dialect,
    options: &ConnectionOptions,
    attempt: F,
) -> DbResult<T>
where
    F: Future<Output = Result<T, NativeError>>,
{
    let deadline = options.connect_timeout();
    match tokio::time::timeout(deadline, attempt).await {
        Ok(Ok(connection)) => Ok(connection),
        Ok(Err(native)) => Err(taxonomy::into_error(dialect, native)),
        Err(_) => Err(DbError::ConnectionTimedOut(NativeError::coded(
            "ETIMEDOUT",
            format!(
                "connect to {} did not complete within {}ms",
                options.endpoint_label(),
                deadline.as_millis()
            ),
        ))),
    }
}

/// Node-style code for an I/O error, as the error tables expect.
pub(crate) fn io_error_code(err: &io::Error) -> Option<&'static str> {
    let code = match err.kind() {
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => "ECONNRESET",
        io::ErrorKind::BrokenPipe => "EPIPE",
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::HostUnreachable => "EHOSTUNREACH",
        io::ErrorKind::NetworkUnreachable => "ENETUNREACH",
        io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
        io::ErrorKind::InvalidInput => "EINVAL",
        io::ErrorKind::UnexpectedEof => "PROTOCOL_CONNECTION_LOST",
        _ => return lookup_failure_code(&err.to_string()),
    };
    Some(code)
}

/// Name resolution failures surface as uncategorized I/O errors.
fn lookup_failure_code(message: &str) -> Option<&'static str> {
    let lower = message.to_lowercase();
    let is_lookup = lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
        || lower.contains("nodename nor servname")
        || lower.contains("no such host");
    is_lookup.then_some("ENOTFOUND")
}

/// Parse a UTC offset such as `+02:00`, `-0530`, `+2` or `Z`. Zone names are
/// not offsets and yield `None`.
pub(crate) fn utc_offset(timezone: &str) -> Option<FixedOffset> {
    let timezone = timezone.trim();
    if timezone.eq_ignore_ascii_case("z") || timezone.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match timezone.as_bytes().first()? {
        b'+' => (1, &timezone[1..]),
        b'-' => (-1, &timezone[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    if hours.is_empty() || !hours.bytes().chain(minutes.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Whether `timezone` looks like an IANA zone name (`Europe/Berlin`, `UTC`).
pub(crate) fn is_zone_name(timezone: &str) -> bool {
    !timezone.is_empty()
        && timezone.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && timezone
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '+'))
}

/// Code for a sqlx error in the vocabulary of the error tables.
fn sqlx_error_code(dialect: Dialect, err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Io(io_err) => io_error_code(io_err).map(String::from),
        sqlx::Error::Configuration(_) => Some("EINVAL".to_string()),
        sqlx::Error::Database(db_err) => match dialect {
            Dialect::Mysql | Dialect::Mariadb => db_err
                .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                .map(|e| mysql::error_name(e.number()))
                .or_else(|| db_err.code().map(|c| c.into_owned())),
            Dialect::Sqlite => db_err
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                // Extended result codes carry the primary code in the low byte.
                .map(|c| (c & 0xff).to_string()),
            _ => db_err.code().map(|c| c.into_owned()),
        },
        // The stream is out of sync with the server; nothing more can be sent on it.
        sqlx::Error::Protocol(_) => Some("PROTOCOL_CONNECTION_LOST".to_string()),
        _ => None,
    }
}

fn sqlx_error_message(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => db_err.message().to_string(),
        other => other.to_string(),
    }
}

/// Translate a sqlx error into a [`NativeError`] with a code the error tables
/// understand.
pub(crate) fn native_from_sqlx(dialect: Dialect, err: sqlx::Error) -> NativeError {
    describe_sqlx(dialect, &err).with_source(err)
}

/// Like [`native_from_sqlx`] for a borrowed error, without the source.
pub(crate) fn describe_sqlx(dialect: Dialect, err: &sqlx::Error) -> NativeError {
    NativeError::new(sqlx_error_code(dialect, err), sqlx_error_message(err))
}

/// A single sqlx connection plus the state the pool needs to reason about it.
pub struct SqlxConnection<C> {
    inner: Option<C>,
    listener: ErrorListener,
}

impl<C> SqlxConnection<C>
where
    C: sqlx::Connection,
{
    pub(crate) fn new(inner: C, listener: ErrorListener) -> Self {
        Self {
            inner: Some(inner),
            listener,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.listener.id()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    pub fn is_valid(&self) -> bool {
        !self.is_closed() && !self.listener.is_invalid()
    }

    /// Borrow the native connection for a query.
    pub fn native(&mut self) -> DbResult<&mut C> {
        let id = self.listener.id();
        self.inner.as_mut().ok_or_else(|| {
            DbError::connection(NativeError::coded(
                "ECONNCLOSED",
                format!("connection {} is already closed", id),
            ))
        })
    }

    /// Feed a driver error observed while using the connection back to its pool.
    /// Returns true if the connection is now considered dead.
    pub fn report(&self, err: &sqlx::Error) -> bool {
        self.listener
            .report(&describe_sqlx(self.listener.dialect(), err))
    }

    /// Report `err` to the pool and classify it.
    pub(crate) fn fail(&self, err: sqlx::Error) -> DbError {
        self.report(&err);
        taxonomy::into_error(self.listener.dialect(), native_from_sqlx(self.listener.dialect(), err))
    }

    /// Close the native connection once; later calls do nothing.
    pub(crate) async fn close(&mut self) -> DbResult<()> {
        match self.inner.take() {
            Some(connection) => {
                let dialect = self.listener.dialect();
                connection
                    .close()
                    .await
                    .map_err(|e| taxonomy::into_error(dialect, native_from_sqlx(dialect, e)))
            }
            None => Ok(()),
        }
    }
}

impl<C> std::fmt::Debug for SqlxConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlxConnection")
            .field("id", &self.listener.id())
            .field("closed", &self.inner.is_none())
            .field("invalid", &self.listener.is_invalid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_codes() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(io_error_code(&refused), Some("ECONNREFUSED"));
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(io_error_code(&reset), Some("ECONNRESET"));
        let lookup = io::Error::other("failed to lookup address information: Name or service not known");
        assert_eq!(io_error_code(&lookup), Some("ENOTFOUND"));
        let other = io::Error::other("something else");
        assert_eq!(io_error_code(&other), None);
    }

    #[test]
    fn test_utc_offset_forms() {
        assert_eq!(utc_offset("+02:00").map(|o| o.local_minus_utc()), Some(7200));
        assert_eq!(utc_offset("-0530").map(|o| o.local_minus_utc()), Some(-19800));
        assert_eq!(utc_offset("+3").map(|o| o.local_minus_utc()), Some(10800));
        assert_eq!(utc_offset("Z").map(|o| o.local_minus_utc()), Some(0));
        assert!(utc_offset("Europe/Berlin").is_none());
        assert!(utc_offset("+02:75").is_none());
        assert!(utc_offset("+0x:00").is_none());
    }

    #[test]
    fn test_utc_offset_rejects_out_of_range_hours() {
        assert!(utc_offset("+9999999").is_none());
        assert!(utc_offset("-99999999999").is_none());
        assert!(utc_offset("+15:00").is_none());
        assert_eq!(utc_offset("+14:00").map(|o| o.local_minus_utc()), Some(50400));
    }

    #[test]
    fn test_zone_names() {
        assert!(is_zone_name("Europe/Berlin"));
        assert!(is_zone_name("America/Argentina/Buenos_Aires"));
        assert!(is_zone_name("Etc/GMT+3"));
        assert!(!is_zone_name("+02:00"));
        assert!(!is_zone_name("UTC'; DROP TABLE x; --"));
    }

    #[test]
    fn test_sqlx_io_error_classifies_as_refused() {
        let err = sqlx::Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        let native = native_from_sqlx(Dialect::Postgres, err);
        assert_eq!(native.code(), Some("ECONNREFUSED"));
        assert!(matches!(
            taxonomy::into_error(Dialect::Postgres, native),
            DbError::ConnectionRefused(_)
        ));
    }

    #[test]
    fn test_sqlx_configuration_error_is_invalid() {
        let err = sqlx::Error::Configuration("bad sslmode".into());
        let native = native_from_sqlx(Dialect::Mysql, err);
        assert!(matches!(
            taxonomy::into_error(Dialect::Mysql, native),
            DbError::InvalidConnectionParameters(_)
        ));
    }

    #[test]
    fn test_listener_report_fatal_notifies_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId::next();
        let listener = ErrorListener::new(id, Dialect::Mysql, tx);

        assert!(!listener.report(&NativeError::coded("ER_DUP_ENTRY", "duplicate")));
        assert!(!listener.is_invalid());

        assert!(listener.report(&NativeError::coded("ECONNRESET", "reset")));
        assert!(listener.report(&NativeError::coded("EPIPE", "pipe")));
        assert!(listener.is_invalid());

        assert_eq!(rx.try_recv().ok(), Some(id));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_detached_listener_still_invalidates() {
        let listener = ErrorListener::detached(Dialect::Mssql);
        assert!(listener.report(&NativeError::coded("ESOCKET", "socket closed")));
        assert!(listener.is_invalid());
    }

    #[tokio::test]
    async fn test_connect_within_times_out() {
        let options = ConnectionOptions {
            connect_timeout_ms: Some(20),
            ..Default::default()
        };
        let result: DbResult<()> = connect_within(Dialect::Postgres, &options, async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DbError::ConnectionTimedOut(_))));
    }

    #[tokio::test]
    async fn test_connect_within_maps_native_error() {
        let options = ConnectionOptions::default();
        let result: DbResult<()> = connect_within(Dialect::Mysql, &options, async {
            Err(NativeError::coded("ER_ACCESS_DENIED_ERROR", "Access denied for user"))
        })
        .await;
        assert!(matches!(result, Err(DbError::AccessDenied(_))));
    }
}
