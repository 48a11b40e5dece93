//! Database connection management library
//!
//! Pools native connections per SQL dialect, routes reads and writes across
//! replicas, resolves the server version once, and maps driver failures onto a
//! small connection error taxonomy.

pub mod config;
pub mod db;
pub mod dialects;
pub mod error;
pub mod models;

pub use config::{Config, ManagerConfig, PoolConfig, PoolOptions, ReplicationConfig};
pub use db::{ConnectionManager, PooledConnection};
pub use dialects::{AnyConnector, DialectConnector, ErrorListener};
pub use error::{ConnectionErrorKind, DbError, DbResult, NativeError};
pub use models::{AcquireOptions, ConnectionOptions, Dialect, QueryType};
