//! Lifecycle hooks around acquisition and native connect/disconnect.

use crate::error::DbResult;
use crate::models::{AcquireOptions, ConnectionOptions};
use async_trait::async_trait;

/// Callbacks the connection manager runs at each stage of a connection's life.
///
/// Every method defaults to a no-op. An error from a `before_*` hook aborts the
/// step it guards.
#[async_trait]
pub trait ConnectionHooks<T: Send + 'static>: Send + Sync + 'static {
    async fn before_pool_acquire(&self, _options: &AcquireOptions) -> DbResult<()> {
        Ok(())
    }

    async fn after_pool_acquire(&self, _connection: &mut T, _options: &AcquireOptions) -> DbResult<()> {
        Ok(())
    }

    /// May rewrite the options used for this connect, e.g. to rotate credentials.
    async fn before_connect(&self, _options: &mut ConnectionOptions) -> DbResult<()> {
        Ok(())
    }

    async fn after_connect(&self, _connection: &mut T, _options: &ConnectionOptions) -> DbResult<()> {
        Ok(())
    }

    async fn before_disconnect(&self, _connection: &mut T) -> DbResult<()> {
        Ok(())
    }

    async fn after_disconnect(&self, _connection: &mut T) -> DbResult<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<T: Send + 'static> ConnectionHooks<T> for NoHooks {}
