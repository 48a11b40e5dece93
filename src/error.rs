//! Error types for the connection manager.
//!
//! Every failure a native driver can produce while opening, validating or closing a
//! connection is folded into one closed taxonomy ([`ConnectionErrorKind`]). The
//! taxonomy variants on [`DbError`] carry the original [`NativeError`] so callers can
//! still inspect the driver's own code and message.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The closed set of connection failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    Refused,
    AccessDenied,
    HostNotFound,
    HostNotReachable,
    InvalidConnection,
    TimedOut,
    AcquireTimeout,
    Generic,
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Refused => "ConnectionRefused",
            Self::AccessDenied => "AccessDenied",
            Self::HostNotFound => "HostNotFound",
            Self::HostNotReachable => "HostNotReachable",
            Self::InvalidConnection => "InvalidConnectionParameters",
            Self::TimedOut => "ConnectionTimedOut",
            Self::AcquireTimeout => "ConnectionAcquireTimeout",
            Self::Generic => "GenericConnectionError",
        };
        f.write_str(name)
    }
}

/// A driver error as the driver reported it.
#[derive(Debug, Clone)]
pub struct NativeError {
    /// Driver code such as `ECONNREFUSED`, a SQLSTATE, or `ORA-01017`.
    pub code: Option<String>,
    pub message: String,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl NativeError {
    pub fn new(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Error with a code and a message.
    pub fn coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Some(code.into()), message)
    }

    /// Error the driver gave no code for.
    pub fn uncoded(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    /// Attach the underlying driver error for diagnostics.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for NativeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(#[source] NativeError),

    #[error("Access denied: {0}")]
    AccessDenied(#[source] NativeError),

    #[error("Host not found: {0}")]
    HostNotFound(#[source] NativeError),

    #[error("Host not reachable: {0}")]
    HostNotReachable(#[source] NativeError),

    #[error("Invalid connection parameters: {0}")]
    InvalidConnectionParameters(#[source] NativeError),

    #[error("Connection timed out: {0}")]
    ConnectionTimedOut(#[source] NativeError),

    #[error("Timed out after {waited_ms}ms acquiring a connection from pool '{pool}'")]
    ConnectionAcquireTimeout { pool: String, waited_ms: u64 },

    #[error("Connection error: {0}")]
    GenericConnection(#[source] NativeError),

    #[error(
        "ConnectionManager.get_connection was called after the connection manager was closed"
    )]
    ManagerClosed,

    #[error("Pool '{pool}' is not accepting work: {reason}")]
    PoolUnavailable { pool: String, reason: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Parse function not supported for type {type_key} in dialect {dialect}")]
    UnsupportedTypeParser { type_key: String, dialect: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Build the taxonomy error for `kind` around a native error.
    ///
    /// `AcquireTimeout` never comes from a driver, so a native error classified that
    /// way is reported as a generic connection error.
    pub fn from_kind(kind: ConnectionErrorKind, native: NativeError) -> Self {
        match kind {
            ConnectionErrorKind::Refused => Self::ConnectionRefused(native),
            ConnectionErrorKind::AccessDenied => Self::AccessDenied(native),
            ConnectionErrorKind::HostNotFound => Self::HostNotFound(native),
            ConnectionErrorKind::HostNotReachable => Self::HostNotReachable(native),
            ConnectionErrorKind::InvalidConnection => Self::InvalidConnectionParameters(native),
            ConnectionErrorKind::TimedOut => Self::ConnectionTimedOut(native),
            ConnectionErrorKind::AcquireTimeout | ConnectionErrorKind::Generic => {
                Self::GenericConnection(native)
            }
        }
    }

    /// Create a generic connection error.
    pub fn connection(native: NativeError) -> Self {
        Self::GenericConnection(native)
    }

    /// Create an acquire timeout error.
    pub fn acquire_timeout(pool: impl Into<String>, waited_ms: u64) -> Self {
        Self::ConnectionAcquireTimeout {
            pool: pool.into(),
            waited_ms,
        }
    }

    pub fn pool_unavailable(pool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PoolUnavailable {
            pool: pool.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn unsupported_type_parser(type_key: impl Into<String>, dialect: impl Into<String>) -> Self {
        Self::UnsupportedTypeParser {
            type_key: type_key.into(),
            dialect: dialect.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The taxonomy kind, for connection-level errors.
    pub fn kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Self::ConnectionRefused(_) => Some(ConnectionErrorKind::Refused),
            Self::AccessDenied(_) => Some(ConnectionErrorKind::AccessDenied),
            Self::HostNotFound(_) => Some(ConnectionErrorKind::HostNotFound),
            Self::HostNotReachable(_) => Some(ConnectionErrorKind::HostNotReachable),
            Self::InvalidConnectionParameters(_) => Some(ConnectionErrorKind::InvalidConnection),
            Self::ConnectionTimedOut(_) => Some(ConnectionErrorKind::TimedOut),
            Self::ConnectionAcquireTimeout { .. } => Some(ConnectionErrorKind::AcquireTimeout),
            Self::GenericConnection(_) => Some(ConnectionErrorKind::Generic),
            _ => None,
        }
    }

    /// The driver error behind a taxonomy error.
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            Self::ConnectionRefused(n)
            | Self::AccessDenied(n)
            | Self::HostNotFound(n)
            | Self::HostNotReachable(n)
            | Self::InvalidConnectionParameters(n)
            | Self::ConnectionTimedOut(n)
            | Self::GenericConnection(n) => Some(n),
            _ => None,
        }
    }

    /// A hint for the operator, if one applies.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self.kind()? {
            ConnectionErrorKind::Refused => {
                Some("Check that the database server is running and accepting connections")
            }
            ConnectionErrorKind::AccessDenied => {
                Some("Verify the username and password for this connection")
            }
            ConnectionErrorKind::HostNotFound => Some("Check the host name and DNS configuration"),
            ConnectionErrorKind::HostNotReachable => {
                Some("Check network routes and firewall rules to the database host")
            }
            ConnectionErrorKind::InvalidConnection => {
                Some("Check the connection options passed to the driver")
            }
            ConnectionErrorKind::TimedOut => {
                Some("The server did not answer in time; check connectivity or raise connect_timeout")
            }
            ConnectionErrorKind::AcquireTimeout => {
                Some("All pool slots stayed busy; release connections sooner or raise pool.max")
            }
            ConnectionErrorKind::Generic => None,
        }
    }

    /// Check if a caller may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            Some(
                ConnectionErrorKind::Refused
                    | ConnectionErrorKind::HostNotReachable
                    | ConnectionErrorKind::TimedOut
                    | ConnectionErrorKind::AcquireTimeout
            )
        )
    }
}

/// Result type alias for connection manager operations.
pub type DbResult<T> = Result<T, DbError>;
