//! Connection management layer.
//!
//! This module provides:
//! - A generic bounded connection pool with idle eviction and validation
//! - Read/write replication topology
//! - The connection manager with single-flight version resolution
//! - A FIFO resource lock for connections that run one command at a time
//! - Per-dialect type parser registry
//! - Lifecycle hooks
//! - Dialect dispatch macros for reducing code duplication

pub mod hooks;
pub(crate) mod macros;
pub mod manager;
pub mod pool;
pub mod replication;
pub mod resource_lock;
pub mod type_parser;
pub mod version;

pub use hooks::{ConnectionHooks, NoHooks};
pub use manager::{ConnectionManager, ManagedFactory};
pub use pool::{ConnectionFactory, Pool, PoolError, PoolStatus, PooledConnection};
pub use replication::{PoolTopology, ReplicatedPool, TopologyStatus};
pub use resource_lock::{ResourceGuard, ResourceLock};
pub use type_parser::{DataTypeDescriptor, TypeParser, TypeParserRegistry};
pub use version::DatabaseVersion;
