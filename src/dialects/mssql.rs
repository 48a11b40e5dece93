//! SQL Server connector using tiberius.
//!
//! A TDS connection runs one request at a time, so every session sits behind a
//! [`ResourceLock`]: callers queue with `lock()` and issue commands while they
//! hold the guard. State checks such as validation read the session through
//! `get_ref()` without queuing.

use super::{DialectConnector, ErrorListener, connect_within, io_error_code};
use crate::db::ResourceLock;
use crate::error::{DbError, DbResult, NativeError};
use crate::models::{ConnectionId, ConnectionOptions, Dialect};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

pub type MssqlClient = Client<Compat<TcpStream>>;

/// A pooled SQL Server connection.
pub type MssqlConnection = ResourceLock<MssqlSession>;

/// Login failed (18456, 18452) and cannot open database (4060).
const LOGIN_ERRORS: &[u32] = &[18456, 18452, 4060];

/// Map a tiberius error onto the codes the SQL Server error table uses.
fn native_from_tiberius(err: tiberius::error::Error) -> NativeError {
    use tiberius::error::Error;

    let (code, message) = match &err {
        Error::Io { kind, message } => socket_code(&io::Error::new(*kind, message.clone())),
        Error::Server(token) if LOGIN_ERRORS.contains(&token.code()) => {
            ("ELOGIN".to_string(), token.message().to_string())
        }
        Error::Server(token) => (token.code().to_string(), token.message().to_string()),
        Error::Tls(message) => ("ESOCKET".to_string(), format!("TLS handshake failed: {}", message)),
        other => return NativeError::uncoded(other.to_string()),
    };
    NativeError::coded(code, message).with_source(err)
}

/// Socket failures surface as `ESOCKET` with the underlying code in the message,
/// except resets and timeouts which carry their own codes.
fn socket_code(err: &io::Error) -> (String, String) {
    match io_error_code(err) {
        Some("ETIMEDOUT") => ("ETIMEOUT".to_string(), err.to_string()),
        Some("ECONNRESET") => ("ECONNRESET".to_string(), err.to_string()),
        Some(code) => ("ESOCKET".to_string(), format!("{} {}", code, err)),
        None => ("ESOCKET".to_string(), err.to_string()),
    }
}

/// One TDS session.
pub struct MssqlSession {
    client: Mutex<Option<MssqlClient>>,
    closed: AtomicBool,
    listener: ErrorListener,
}

impl MssqlSession {
    fn new(client: MssqlClient, listener: ErrorListener) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            closed: AtomicBool::new(false),
            listener,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.listener.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_valid(&self) -> bool {
        !self.is_closed() && !self.listener.is_invalid()
    }

    /// The tiberius client. Only call this while holding the session's lock.
    pub async fn client(&self) -> DbResult<MappedMutexGuard<'_, MssqlClient>> {
        let guard = self.client.lock().await;
        MutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| {
            DbError::connection(NativeError::coded(
                "ECONNCLOSED",
                format!("connection {} is already closed", self.listener.id()),
            ))
        })
    }

    /// Report a driver error seen on this session and classify it. Socket errors
    /// invalidate the session.
    pub fn fail(&self, err: tiberius::error::Error) -> DbError {
        let native = native_from_tiberius(err);
        self.listener.report(&native);
        super::taxonomy::into_error(Dialect::Mssql, native)
    }

    async fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let taken = self.client.lock().await.take();
        match taken {
            Some(client) => client
                .close()
                .await
                .map_err(|e| super::taxonomy::into_error(Dialect::Mssql, native_from_tiberius(e))),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for MssqlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlSession")
            .field("id", &self.listener.id())
            .field("closed", &self.is_closed())
            .field("invalid", &self.listener.is_invalid())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlConnector;

impl MssqlConnector {
    pub fn new() -> Self {
        Self
    }

    pub fn config(options: &ConnectionOptions) -> DbResult<Config> {
        let mut config = Config::new();
        config.host(options.host_or_default());
        config.port(options.port_or_default(Dialect::Mssql).unwrap_or(1433));
        if let Some(database) = &options.database {
            config.database(database);
        }
        if let Some(name) = options.dialect_option_str("application_name") {
            config.application_name(name);
        }

        let username = options.username.as_deref().ok_or_else(|| {
            DbError::InvalidConnectionParameters(NativeError::coded(
                "EINVAL",
                "SQL Server authentication requires a username",
            ))
        })?;
        config.authentication(AuthMethod::sql_server(
            username,
            options.password.as_deref().unwrap_or(""),
        ));

        if options.dialect_option_bool("trust_server_certificate") == Some(true) {
            config.trust_cert();
        }
        let encryption = match options.dialect_option_bool("encrypt") {
            Some(false) => EncryptionLevel::Off,
            _ => EncryptionLevel::Required,
        };
        config.encryption(encryption);
        Ok(config)
    }

    async fn handshake(config: Config) -> Result<MssqlClient, tiberius::error::Error> {
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        Client::connect(config, tcp.compat_write()).await
    }

    /// Connect, following one routing redirect (Azure gateways send these).
    async fn establish(mut config: Config) -> Result<MssqlClient, NativeError> {
        match Self::handshake(config.clone()).await {
            Ok(client) => Ok(client),
            Err(tiberius::error::Error::Routing { host, port }) => {
                debug!(host = %host, port, "Following SQL Server routing redirect");
                config.host(&host);
                config.port(port);
                Self::handshake(config).await.map_err(native_from_tiberius)
            }
            Err(e) => Err(native_from_tiberius(e)),
        }
    }
}

#[async_trait]
impl DialectConnector for MssqlConnector {
    type Connection = MssqlConnection;

    fn dialect(&self) -> Dialect {
        Dialect::Mssql
    }

    async fn connect(
        &self,
        options: &ConnectionOptions,
        listener: ErrorListener,
    ) -> DbResult<MssqlConnection> {
        let config = Self::config(options)?;
        let client = connect_within(Dialect::Mssql, options, Self::establish(config)).await?;
        debug!(connection_id = %listener.id(), endpoint = %options.endpoint_label(), "Connected to SQL Server");
        Ok(ResourceLock::new(MssqlSession::new(client, listener)))
    }

    async fn disconnect(&self, connection: &mut MssqlConnection) -> DbResult<()> {
        if connection.get_ref().is_closed() {
            return Ok(());
        }
        // Wait for in-flight requests before closing the socket.
        let session = connection.lock().await;
        session.close().await
    }

    fn validate(&self, connection: &MssqlConnection) -> bool {
        connection.get_ref().is_valid()
    }

    async fn database_version(&self, connection: &mut MssqlConnection) -> DbResult<String> {
        let session = connection.lock().await;
        let result = {
            let mut client = session.client().await?;
            let stream = client
                .simple_query("SELECT CAST(SERVERPROPERTY('ProductVersion') AS NVARCHAR(128))")
                .await;
            match stream {
                Ok(stream) => stream.into_row().await,
                Err(e) => Err(e),
            }
        };
        let row = result.map_err(|e| session.fail(e))?;
        let version = row
            .as_ref()
            .map(|row| row.try_get::<&str, _>(0))
            .transpose()
            .map_err(|e| session.fail(e))?
            .flatten();
        version.map(String::from).ok_or_else(|| {
            DbError::connection(NativeError::uncoded("SERVERPROPERTY('ProductVersion') returned no rows"))
        })
    }
}
