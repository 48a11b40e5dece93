//! Connection-related data models.
//!
//! This module defines the supported dialects and the per-endpoint connection
//! options every dialect connector receives.

use crate::config::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_TIMEZONE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Supported database dialects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    Mysql,
    Mariadb,
    Sqlite,
    Mssql,
    Oracle,
}

impl Dialect {
    pub const ALL: [Dialect; 6] = [
        Dialect::Postgres,
        Dialect::Mysql,
        Dialect::Mariadb,
        Dialect::Sqlite,
        Dialect::Mssql,
        Dialect::Oracle,
    ];

    /// Look up a dialect by its registry name or a common alias.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            "mysql" => Some(Self::Mysql),
            "mariadb" => Some(Self::Mariadb),
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            "mssql" | "sqlserver" | "tedious" => Some(Self::Mssql),
            "oracle" | "oracledb" => Some(Self::Oracle),
            _ => None,
        }
    }

    /// Parse the dialect from a connection string's scheme.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let scheme = connection_string.split(':').next()?;
        Self::from_name(scheme)
    }

    /// The registry name, also used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
            Self::Sqlite => "sqlite",
            Self::Mssql => "mssql",
            Self::Oracle => "oracle",
        }
    }

    /// Get the display name for this dialect.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::Mysql => "MySQL",
            Self::Mariadb => "MariaDB",
            Self::Sqlite => "SQLite",
            Self::Mssql => "SQL Server",
            Self::Oracle => "Oracle",
        }
    }

    /// Get the default port for this dialect.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::Mysql | Self::Mariadb => Some(3306),
            Self::Mssql => Some(1433),
            Self::Oracle => Some(1521),
            Self::Sqlite => None,
        }
    }

    /// Oldest engine version this crate is tested against.
    pub fn minimum_version(&self) -> &'static str {
        match self {
            Self::Postgres => "9.5.0",
            Self::Mysql => "5.7.0",
            Self::Mariadb => "10.1.44",
            Self::Sqlite => "3.8.0",
            Self::Mssql => "11.0.0",
            Self::Oracle => "18.0.0",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Dialect {
    type Err = ConnectionConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| ConnectionConfigError::UnknownDialect(s.to_string()))
    }
}

/// Options for one database endpoint.
///
/// Every field is optional so replica entries can leave gaps that are filled from
/// the base options (see [`ConnectionOptions::defaulted_from`]).
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub database: Option<String>,
    /// SQLite file path, or `:memory:`.
    pub storage: Option<String>,
    /// Session time zone, either an offset like `+02:00` or a zone name.
    pub timezone: Option<String>,
    /// Leave the server's session time zone untouched.
    pub keep_default_timezone: Option<bool>,
    pub connect_timeout_ms: Option<u64>,
    /// Driver-specific options passed through untouched.
    pub dialect_options: Option<Map<String, Value>>,
}

impl ConnectionOptions {
    pub fn host_or_default(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    pub fn port_or_default(&self, dialect: Dialect) -> Option<u16> {
        self.port.or_else(|| dialect.default_port())
    }

    pub fn timezone_or_default(&self) -> &str {
        self.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE)
    }

    pub fn keep_default_timezone(&self) -> bool {
        self.keep_default_timezone.unwrap_or(false)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }

    pub fn dialect_option(&self, key: &str) -> Option<&Value> {
        self.dialect_options.as_ref()?.get(key)
    }

    pub fn dialect_option_bool(&self, key: &str) -> Option<bool> {
        match self.dialect_option(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    pub fn dialect_option_str(&self, key: &str) -> Option<&str> {
        self.dialect_option(key)?.as_str()
    }

    /// Fill every unset field from `base`. Fields set on `self` win; the merge is
    /// shallow, so a replica's `dialect_options` replaces the base map entirely.
    pub fn defaulted_from(&self, base: &ConnectionOptions) -> ConnectionOptions {
        ConnectionOptions {
            host: self.host.clone().or_else(|| base.host.clone()),
            port: self.port.or(base.port),
            username: self.username.clone().or_else(|| base.username.clone()),
            password: self.password.clone().or_else(|| base.password.clone()),
            database: self.database.clone().or_else(|| base.database.clone()),
            storage: self.storage.clone().or_else(|| base.storage.clone()),
            timezone: self.timezone.clone().or_else(|| base.timezone.clone()),
            keep_default_timezone: self.keep_default_timezone.or(base.keep_default_timezone),
            connect_timeout_ms: self.connect_timeout_ms.or(base.connect_timeout_ms),
            dialect_options: self
                .dialect_options
                .clone()
                .or_else(|| base.dialect_options.clone()),
        }
    }

    /// A display-safe `user@host:port/database` label for logs.
    pub fn endpoint_label(&self) -> String {
        let mut label = String::new();
        if let Some(user) = &self.username {
            label.push_str(user);
            label.push('@');
        }
        if let Some(storage) = &self.storage {
            label.push_str(storage);
            return label;
        }
        label.push_str(self.host_or_default());
        if let Some(port) = self.port {
            label.push_str(&format!(":{}", port));
        }
        if let Some(db) = &self.database {
            label.push('/');
            label.push_str(db);
        }
        label
    }
}

impl std::fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("database", &self.database)
            .field("storage", &self.storage)
            .field("timezone", &self.timezone)
            .field("keep_default_timezone", &self.keep_default_timezone)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("dialect_options", &self.dialect_options)
            .finish()
    }
}

/// Errors that can occur when building connection configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionConfigError {
    #[error("Unknown dialect: {0}")]
    UnknownDialect(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid pool options: {0}")]
    InvalidPoolOptions(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dialect_from_connection_string() {
        assert_eq!(
            Dialect::from_connection_string("postgres://localhost/db"),
            Some(Dialect::Postgres)
        );
        assert_eq!(
            Dialect::from_connection_string("postgresql://localhost/db"),
            Some(Dialect::Postgres)
        );
        assert_eq!(
            Dialect::from_connection_string("mariadb://localhost/db"),
            Some(Dialect::Mariadb)
        );
        assert_eq!(
            Dialect::from_connection_string("sqlite::memory:"),
            Some(Dialect::Sqlite)
        );
        assert_eq!(
            Dialect::from_connection_string("mssql://sa@localhost"),
            Some(Dialect::Mssql)
        );
        assert_eq!(Dialect::from_connection_string("unknown://localhost"), None);
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Dialect::Postgres.default_port(), Some(5432));
        assert_eq!(Dialect::Mysql.default_port(), Some(3306));
        assert_eq!(Dialect::Mariadb.default_port(), Some(3306));
        assert_eq!(Dialect::Mssql.default_port(), Some(1433));
        assert_eq!(Dialect::Sqlite.default_port(), None);
    }

    #[test]
    fn test_dialect_from_str() {
        assert_eq!("sqlserver".parse::<Dialect>().ok(), Some(Dialect::Mssql));
        assert!("db2".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_defaulted_from_explicit_fields_win() {
        let base = ConnectionOptions {
            host: Some("primary".into()),
            port: Some(5432),
            username: Some("app".into()),
            password: Some("secret".into()),
            database: Some("shop".into()),
            dialect_options: Some(json!({"ssl": true}).as_object().cloned().unwrap()),
            ..Default::default()
        };
        let replica = ConnectionOptions {
            host: Some("replica-1".into()),
            username: Some("reader".into()),
            ..Default::default()
        };

        let merged = replica.defaulted_from(&base);
        assert_eq!(merged.host.as_deref(), Some("replica-1"));
        assert_eq!(merged.username.as_deref(), Some("reader"));
        assert_eq!(merged.password.as_deref(), Some("secret"));
        assert_eq!(merged.port, Some(5432));
        assert_eq!(merged.database.as_deref(), Some("shop"));
        assert_eq!(merged.dialect_option_bool("ssl"), Some(true));
    }

    #[test]
    fn test_debug_masks_password() {
        let options = ConnectionOptions {
            password: Some("hunter2".into()),
            ..Default::default()
        };
        let rendered = format!("{:?}", options);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("****"));
    }

    #[test]
    fn test_endpoint_label() {
        let options = ConnectionOptions {
            host: Some("db.internal".into()),
            port: Some(3306),
            username: Some("app".into()),
            database: Some("sales".into()),
            ..Default::default()
        };
        assert_eq!(options.endpoint_label(), "app@db.internal:3306/sales");
    }
}
