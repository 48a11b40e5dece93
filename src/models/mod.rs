//! Data models for the connection manager.
//!
//! This module re-exports all model types used throughout the crate.

pub mod acquire;
pub mod connection;

// Re-export commonly used types
pub use acquire::{AcquireOptions, ConnectionId, QueryType, ReplicaRole};
pub use connection::{ConnectionConfigError, ConnectionOptions, Dialect};
