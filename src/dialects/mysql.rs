//! MySQL connector. MariaDB reuses most of it.

use super::{DialectConnector, ErrorListener, SqlxConnection, connect_within, native_from_sqlx};
use crate::error::{DbError, DbResult, NativeError};
use crate::models::{ConnectionOptions, Dialect};
use async_trait::async_trait;
use sqlx::Connection;
use sqlx::mysql::{MySqlConnectOptions, MySqlSslMode};
use tracing::debug;

pub type MySqlConnection = SqlxConnection<sqlx::MySqlConnection>;

/// Symbolic name for a MySQL error number, as used in the error tables.
pub(crate) fn error_name(number: u16) -> String {
    match number {
        1044 => "ER_DBACCESS_DENIED_ERROR".to_string(),
        1045 => "ER_ACCESS_DENIED_ERROR".to_string(),
        1698 => "ER_ACCESS_DENIED_NO_PASSWORD_ERROR".to_string(),
        2013 => "PROTOCOL_CONNECTION_LOST".to_string(),
        other => other.to_string(),
    }
}

/// Connect options shared by the MySQL and MariaDB connectors.
pub(crate) fn connect_options(
    dialect: Dialect,
    options: &ConnectionOptions,
) -> DbResult<MySqlConnectOptions> {
    let mut my = MySqlConnectOptions::new()
        .host(options.host_or_default())
        .port(options.port_or_default(dialect).unwrap_or(3306))
        .charset(options.dialect_option_str("charset").unwrap_or("utf8mb4"));
    if let Some(username) = &options.username {
        my = my.username(username);
    }
    if let Some(password) = &options.password {
        my = my.password(password);
    }
    if let Some(database) = &options.database {
        my = my.database(database);
    }
    if let Some(mode) = options
        .dialect_option_str("ssl_mode")
        .or_else(|| options.dialect_option_str("ssl-mode"))
    {
        let mode: MySqlSslMode = mode.parse().map_err(|_| {
            DbError::InvalidConnectionParameters(NativeError::coded(
                "EINVAL",
                format!("unknown ssl mode '{}'", mode),
            ))
        })?;
        my = my.ssl_mode(mode);
    }
    Ok(my)
}

/// Open a connection and pin the session time zone with a bound parameter.
pub(crate) async fn open(
    dialect: Dialect,
    options: &ConnectionOptions,
    listener: ErrorListener,
    timezone: Option<String>,
) -> DbResult<MySqlConnection> {
    let connect_options = connect_options(dialect, options)?;
    let native = connect_within(dialect, options, async {
        sqlx::MySqlConnection::connect_with(&connect_options)
            .await
            .map_err(|e| native_from_sqlx(dialect, e))
    })
    .await?;
    let mut connection = SqlxConnection::new(native, listener);

    if let Some(timezone) = timezone {
        let result = {
            let native = connection.native()?;
            sqlx::query("SET time_zone = ?")
                .bind(&timezone)
                .execute(&mut *native)
                .await
        };
        if let Err(e) = result {
            let err = connection.fail(e);
            let _ = connection.close().await;
            return Err(err);
        }
    }

    debug!(
        connection_id = %connection.id(),
        dialect = %dialect,
        endpoint = %options.endpoint_label(),
        "Connected"
    );
    Ok(connection)
}

pub(crate) async fn server_version(connection: &mut MySqlConnection) -> DbResult<String> {
    let result = {
        let native = connection.native()?;
        sqlx::query_scalar::<_, String>("SELECT VERSION()")
            .fetch_one(&mut *native)
            .await
    };
    result.map_err(|e| connection.fail(e))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnector;

impl MySqlConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DialectConnector for MySqlConnector {
    type Connection = MySqlConnection;

    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    async fn connect(
        &self,
        options: &ConnectionOptions,
        listener: ErrorListener,
    ) -> DbResult<MySqlConnection> {
        let timezone = (!options.keep_default_timezone())
            .then(|| options.timezone_or_default().to_string());
        open(Dialect::Mysql, options, listener, timezone).await
    }

    async fn disconnect(&self, connection: &mut MySqlConnection) -> DbResult<()> {
        connection.close().await
    }

    fn validate(&self, connection: &MySqlConnection) -> bool {
        connection.is_valid()
    }

    async fn database_version(&self, connection: &mut MySqlConnection) -> DbResult<String> {
        server_version(connection).await
    }
}
