//! FIFO async lock around a resource that must run one command at a time.
//!
//! Each [`ResourceLock::lock`] call takes its place in line immediately (before the
//! returned future is first polled) by swapping a fresh oneshot channel into the
//! tail of the chain. The caller waits on the previous tail; the returned
//! [`ResourceGuard`] owns the sender that releases the next caller.
//!
//! # Release guarantees
//!
//! - Dropping the guard releases the next waiter, so `?` returns, errors and panics
//!   inside a held scope all hand the resource on.
//! - A lock future dropped while still queued keeps its place in the chain: a task
//!   spawned on drop waits for its predecessor and then releases its successor, so
//!   cancelling a waiter never lets the next one overtake the current holder.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

pub struct ResourceLock<T> {
    resource: Arc<T>,
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl<T> ResourceLock<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(resource: T) -> Self {
        Self {
            resource: Arc::new(resource),
            tail: Mutex::new(None),
        }
    }

    /// The resource, without queuing. For identity and state checks only; issue
    /// commands through [`lock`](Self::lock).
    pub fn get_ref(&self) -> &T {
        &self.resource
    }

    /// Queue for exclusive access. Grants are handed out in call order.
    pub fn lock(&self) -> impl Future<Output = ResourceGuard<T>> + Send + 'static {
        let (release, next) = oneshot::channel();
        let previous = self.tail.lock().replace(next);
        let resource = Arc::clone(&self.resource);

        let mut turn = Turn {
            previous,
            release: Some(release),
        };

        async move {
            if let Some(previous) = turn.previous.as_mut() {
                // Err means the holder's sender was dropped, which is also a release.
                let _ = previous.await;
            }
            turn.previous = None;
            ResourceGuard {
                resource,
                release: turn.release.take(),
            }
        }
    }

    /// Whether nobody holds or waits for the resource.
    pub fn is_idle(&self) -> bool {
        let mut tail = self.tail.lock();
        match tail.as_mut() {
            None => true,
            Some(receiver) => match receiver.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => false,
                _ => {
                    *tail = None;
                    true
                }
            },
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ResourceLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLock")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

/// A caller's place in line, owned by the pending lock future.
struct Turn {
    previous: Option<oneshot::Receiver<()>>,
    release: Option<oneshot::Sender<()>>,
}

impl Drop for Turn {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        let Some(previous) = self.previous.take() else {
            // Our turn already came (or nobody was ahead); let the next one go.
            let _ = release.send(());
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = previous.await;
                    let _ = release.send(());
                });
            }
            Err(_) => {
                // No runtime to wait on: release immediately.
                drop(previous);
                let _ = release.send(());
            }
        }
    }
}

/// Exclusive access to the resource. Dropping it releases the next waiter.
#[derive(Debug)]
pub struct ResourceGuard<T> {
    resource: Arc<T>,
    release: Option<oneshot::Sender<()>>,
}

impl<T> ResourceGuard<T> {
    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
    }
}

impl<T> std::ops::Deref for ResourceGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<T> Drop for ResourceGuard<T> {
    fn drop(&mut self) {
        self.release_now();
    }
}
