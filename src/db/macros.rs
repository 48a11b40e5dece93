//! Dialect dispatch macros for reducing code duplication.
//!
//! [`AnyConnector`](crate::dialects::AnyConnector) and
//! [`AnyConnection`](crate::dialects::AnyConnection) have one variant per backend,
//! and feature-gated backends only exist in some builds. These macros write the
//! match arms (including the `#[cfg]` ones) once.

/// Run the same body against whichever connector a [`AnyConnector`] holds.
///
/// # Example
///
/// ```ignore
/// dispatch_connector!(self, c => c.dialect())
/// ```
///
/// [`AnyConnector`]: crate::dialects::AnyConnector
macro_rules! dispatch_connector {
    ($connector:expr, $c:ident => $body:expr) => {
        match $connector {
            $crate::dialects::AnyConnector::Postgres($c) => $body,
            $crate::dialects::AnyConnector::Mysql($c) => $body,
            $crate::dialects::AnyConnector::Mariadb($c) => $body,
            $crate::dialects::AnyConnector::Sqlite($c) => $body,
            #[cfg(feature = "mssql")]
            $crate::dialects::AnyConnector::Mssql($c) => $body,
            #[cfg(feature = "oracle")]
            $crate::dialects::AnyConnector::Oracle($c) => $body,
        }
    };
}

/// Pair a connector with a connection of the same backend and run the body;
/// any other pairing evaluates `mismatch`.
///
/// # Example
///
/// ```ignore
/// dispatch_connection!(self, connection, (c, conn) => c.disconnect(conn).await, mismatch => Err(..))
/// ```
macro_rules! dispatch_connection {
    ($connector:expr, $connection:expr, ($c:ident, $conn:ident) => $body:expr, mismatch => $otherwise:expr) => {
        match ($connector, $connection) {
            (
                $crate::dialects::AnyConnector::Postgres($c),
                $crate::dialects::AnyConnection::Postgres($conn),
            ) => $body,
            (
                $crate::dialects::AnyConnector::Mysql($c),
                $crate::dialects::AnyConnection::Mysql($conn),
            ) => $body,
            (
                $crate::dialects::AnyConnector::Mariadb($c),
                $crate::dialects::AnyConnection::Mariadb($conn),
            ) => $body,
            (
                $crate::dialects::AnyConnector::Sqlite($c),
                $crate::dialects::AnyConnection::Sqlite($conn),
            ) => $body,
            #[cfg(feature = "mssql")]
            (
                $crate::dialects::AnyConnector::Mssql($c),
                $crate::dialects::AnyConnection::Mssql($conn),
            ) => $body,
            #[cfg(feature = "oracle")]
            (
                $crate::dialects::AnyConnector::Oracle($c),
                $crate::dialects::AnyConnection::Oracle($conn),
            ) => $body,
            #[allow(unreachable_patterns)]
            _ => $otherwise,
        }
    };
}

pub(crate) use dispatch_connection;
pub(crate) use dispatch_connector;
