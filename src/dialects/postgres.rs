//! PostgreSQL connector.

use super::{
    DialectConnector, ErrorListener, SqlxConnection, connect_within, is_zone_name,
    native_from_sqlx, utc_offset,
};
use crate::error::{DbError, DbResult, NativeError};
use crate::models::{ConnectionOptions, Dialect};
use async_trait::async_trait;
use sqlx::Connection;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use tracing::debug;

pub type PostgresConnection = SqlxConnection<sqlx::PgConnection>;

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresConnector;

impl PostgresConnector {
    pub fn new() -> Self {
        Self
    }

    /// Translate connection options into sqlx connect options.
    ///
    /// `client_min_messages` and `standard_conforming_strings` travel in the
    /// startup packet; the time zone is set after connecting.
    pub fn connect_options(options: &ConnectionOptions) -> DbResult<PgConnectOptions> {
        let mut pg = PgConnectOptions::new()
            .host(options.host_or_default())
            .port(options.port_or_default(Dialect::Postgres).unwrap_or(5432));
        if let Some(username) = &options.username {
            pg = pg.username(username);
        }
        if let Some(password) = &options.password {
            pg = pg.password(password);
        }
        if let Some(database) = &options.database {
            pg = pg.database(database);
        }
        if let Some(mode) = options.dialect_option_str("sslmode") {
            let mode: PgSslMode = mode.parse().map_err(|_| {
                DbError::InvalidConnectionParameters(NativeError::coded(
                    "EINVAL",
                    format!("unknown sslmode '{}'", mode),
                ))
            })?;
            pg = pg.ssl_mode(mode);
        }
        if let Some(name) = options.dialect_option_str("application_name") {
            pg = pg.application_name(name);
        }
        let min_messages = options
            .dialect_option_str("client_min_messages")
            .unwrap_or("warning");
        Ok(pg.options([
            ("client_min_messages", min_messages),
            ("standard_conforming_strings", "on"),
        ]))
    }
}

/// `SET TIME ZONE` for the configured zone, or `None` when the server default
/// is kept.
fn time_zone_statement(options: &ConnectionOptions) -> DbResult<Option<String>> {
    if options.keep_default_timezone() {
        return Ok(None);
    }
    let timezone = options.timezone_or_default();
    if let Some(offset) = utc_offset(timezone) {
        return Ok(Some(format!("SET TIME ZONE INTERVAL '{}' HOUR TO MINUTE", offset)));
    }
    if is_zone_name(timezone) {
        return Ok(Some(format!("SET TIME ZONE '{}'", timezone)));
    }
    Err(DbError::InvalidConnectionParameters(NativeError::coded(
        "EINVAL",
        format!("invalid time zone '{}'", timezone),
    )))
}

/// Render `server_version_num` the way `server_version` would.
fn format_version_num(num: u32) -> String {
    let major = num / 10_000;
    if major >= 10 {
        format!("{}.{}", major, num % 10_000)
    } else {
        format!("{}.{}.{}", major, (num / 100) % 100, num % 100)
    }
}

#[async_trait]
impl DialectConnector for PostgresConnector {
    type Connection = PostgresConnection;

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn connect(
        &self,
        options: &ConnectionOptions,
        listener: ErrorListener,
    ) -> DbResult<PostgresConnection> {
        let connect_options = Self::connect_options(options)?;
        let set_time_zone = time_zone_statement(options)?;

        let native = connect_within(Dialect::Postgres, options, async {
            sqlx::PgConnection::connect_with(&connect_options)
                .await
                .map_err(|e| native_from_sqlx(Dialect::Postgres, e))
        })
        .await?;
        let mut connection = SqlxConnection::new(native, listener);

        if let Some(statement) = set_time_zone {
            let result = {
                let native = connection.native()?;
                sqlx::Executor::execute(&mut *native, sqlx::raw_sql(&statement)).await
            };
            if let Err(e) = result {
                let err = connection.fail(e);
                let _ = connection.close().await;
                return Err(err);
            }
        }

        debug!(connection_id = %connection.id(), endpoint = %options.endpoint_label(), "Connected to PostgreSQL");
        Ok(connection)
    }

    async fn disconnect(&self, connection: &mut PostgresConnection) -> DbResult<()> {
        connection.close().await
    }

    fn validate(&self, connection: &PostgresConnection) -> bool {
        connection.is_valid()
    }

    async fn database_version(&self, connection: &mut PostgresConnection) -> DbResult<String> {
        let result = {
            let native = connection.native()?;
            if let Some(num) = native.server_version_num() {
                return Ok(format_version_num(num));
            }
            sqlx::query_scalar::<_, String>("SHOW server_version")
                .fetch_one(&mut *native)
                .await
        };
        result.map_err(|e| connection.fail(e))
    }
}
