//! Runtime connector selection.
//!
//! [`AnyConnector`] picks a backend from a [`Dialect`] so a manager can be built
//! from configuration alone. Backends behind a disabled cargo feature are
//! rejected with a configuration error.

use super::{
    DialectConnector, ErrorListener, MariaDbConnector, MySqlConnection, MySqlConnector,
    PostgresConnection, PostgresConnector, SqliteConnector, SqliteHandle,
};
#[cfg(feature = "mssql")]
use super::{MssqlConnection, MssqlConnector};
#[cfg(feature = "oracle")]
use super::{OracleConnection, OracleConnector};
use crate::db::macros::{dispatch_connection, dispatch_connector};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionId, ConnectionOptions, Dialect};
use async_trait::async_trait;

#[derive(Debug)]
pub enum AnyConnector {
    Postgres(PostgresConnector),
    Mysql(MySqlConnector),
    Mariadb(MariaDbConnector),
    Sqlite(SqliteConnector),
    #[cfg(feature = "mssql")]
    Mssql(MssqlConnector),
    #[cfg(feature = "oracle")]
    Oracle(OracleConnector),
}

#[derive(Debug)]
pub enum AnyConnection {
    Postgres(PostgresConnection),
    Mysql(MySqlConnection),
    Mariadb(MySqlConnection),
    Sqlite(SqliteHandle),
    #[cfg(feature = "mssql")]
    Mssql(MssqlConnection),
    #[cfg(feature = "oracle")]
    Oracle(OracleConnection),
}

impl AnyConnector {
    /// The connector registered for `dialect`.
    pub fn for_dialect(dialect: Dialect) -> DbResult<Self> {
        let connector = match dialect {
            Dialect::Postgres => Self::Postgres(PostgresConnector::new()),
            Dialect::Mysql => Self::Mysql(MySqlConnector::new()),
            Dialect::Mariadb => Self::Mariadb(MariaDbConnector::new()),
            Dialect::Sqlite => Self::Sqlite(SqliteConnector::new()),
            #[cfg(feature = "mssql")]
            Dialect::Mssql => Self::Mssql(MssqlConnector::new()),
            #[cfg(feature = "oracle")]
            Dialect::Oracle => Self::Oracle(OracleConnector::new()),
            #[allow(unreachable_patterns)]
            other => {
                return Err(DbError::invalid_config(format!(
                    "dialect '{}' is not compiled in; rebuild with the '{}' feature",
                    other, other
                )));
            }
        };
        Ok(connector)
    }
}

impl AnyConnection {
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Postgres(_) => Dialect::Postgres,
            Self::Mysql(_) => Dialect::Mysql,
            Self::Mariadb(_) => Dialect::Mariadb,
            Self::Sqlite(_) => Dialect::Sqlite,
            #[cfg(feature = "mssql")]
            Self::Mssql(_) => Dialect::Mssql,
            #[cfg(feature = "oracle")]
            Self::Oracle(_) => Dialect::Oracle,
        }
    }

    pub fn id(&self) -> ConnectionId {
        match self {
            Self::Postgres(c) => c.id(),
            Self::Mysql(c) | Self::Mariadb(c) => c.id(),
            Self::Sqlite(c) => c.id(),
            #[cfg(feature = "mssql")]
            Self::Mssql(c) => c.get_ref().id(),
            #[cfg(feature = "oracle")]
            Self::Oracle(c) => c.id(),
        }
    }
}

fn mismatched(connector: Dialect, connection: Dialect) -> DbError {
    DbError::internal(format!(
        "{} connection handed to the {} connector",
        connection, connector
    ))
}

#[async_trait]
impl DialectConnector for AnyConnector {
    type Connection = AnyConnection;

    fn dialect(&self) -> Dialect {
        dispatch_connector!(self, c => c.dialect())
    }

    async fn connect(
        &self,
        options: &ConnectionOptions,
        listener: ErrorListener,
    ) -> DbResult<AnyConnection> {
        let connection = match self {
            Self::Postgres(c) => AnyConnection::Postgres(c.connect(options, listener).await?),
            Self::Mysql(c) => AnyConnection::Mysql(c.connect(options, listener).await?),
            Self::Mariadb(c) => AnyConnection::Mariadb(c.connect(options, listener).await?),
            Self::Sqlite(c) => AnyConnection::Sqlite(c.connect(options, listener).await?),
            #[cfg(feature = "mssql")]
            Self::Mssql(c) => AnyConnection::Mssql(c.connect(options, listener).await?),
            #[cfg(feature = "oracle")]
            Self::Oracle(c) => AnyConnection::Oracle(c.connect(options, listener).await?),
        };
        Ok(connection)
    }

    async fn disconnect(&self, connection: &mut AnyConnection) -> DbResult<()> {
        let found = connection.dialect();
        dispatch_connection!(
            self,
            connection,
            (c, conn) => c.disconnect(conn).await,
            mismatch => Err(mismatched(self.dialect(), found))
        )
    }

    fn validate(&self, connection: &AnyConnection) -> bool {
        dispatch_connection!(self, connection, (c, conn) => c.validate(conn), mismatch => false)
    }

    async fn database_version(&self, connection: &mut AnyConnection) -> DbResult<String> {
        let found = connection.dialect();
        dispatch_connection!(
            self,
            connection,
            (c, conn) => c.database_version(conn).await,
            mismatch => Err(mismatched(self.dialect(), found))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_dialect_matches_dialect() {
        for dialect in [Dialect::Postgres, Dialect::Mysql, Dialect::Mariadb, Dialect::Sqlite] {
            let connector = AnyConnector::for_dialect(dialect).unwrap();
            assert_eq!(connector.dialect(), dialect);
        }
    }

    #[cfg(not(feature = "oracle"))]
    #[test]
    fn test_disabled_dialect_is_a_config_error() {
        let err = AnyConnector::for_dialect(Dialect::Oracle).unwrap_err();
        assert!(matches!(err, DbError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_sqlite_round_trip_through_any() {
        let connector = AnyConnector::for_dialect(Dialect::Sqlite).unwrap();
        let mut connection = connector
            .connect(&ConnectionOptions::default(), ErrorListener::detached(Dialect::Sqlite))
            .await
            .unwrap();
        assert_eq!(connection.dialect(), Dialect::Sqlite);
        assert!(connector.validate(&connection));
        let version = connector.database_version(&mut connection).await.unwrap();
        assert!(version.starts_with('3'));
        connector.disconnect(&mut connection).await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_connection_is_rejected() {
        let sqlite = AnyConnector::for_dialect(Dialect::Sqlite).unwrap();
        let mut connection = sqlite
            .connect(&ConnectionOptions::default(), ErrorListener::detached(Dialect::Sqlite))
            .await
            .unwrap();
        let postgres = AnyConnector::for_dialect(Dialect::Postgres).unwrap();
        assert!(!postgres.validate(&connection));
        assert!(postgres.disconnect(&mut connection).await.is_err());
        sqlite.disconnect(&mut connection).await.unwrap();
    }
}
