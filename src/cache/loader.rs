//! Cache Loader Hook
//!
//! Caches may be configured with a [`CacheLoader`] that fetches values from
//! an external system of record. Loads run on spawned tasks, bounded per cache
//! by a semaphore, and complete through a [`LoadHandle`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::entry::{CacheKey, CacheValue};
use crate::error::{Error, Result};

/// External value source for a cache
#[async_trait]
pub trait CacheLoader<K: CacheKey, V: CacheValue>: Send + Sync {
    /// Load one value; `Ok(None)` when the source has nothing for `key`
    async fn load(&self, key: &K) -> anyhow::Result<Option<V>>;

    /// Load several values; missing keys are simply absent from the result
    async fn load_all(&self, keys: &[K]) -> anyhow::Result<Vec<(K, V)>> {
        let mut loaded = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.load(key).await? {
                loaded.push((key.clone(), value));
            }
        }
        Ok(loaded)
    }
}

/// Awaitable completion of a background load
///
/// Dropping the handle does not cancel the load.
pub struct LoadHandle<T> {
    cache: Arc<str>,
    task: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> LoadHandle<T> {
    /// Spawn `fut` on the current runtime
    pub(crate) fn spawn<F>(cache: Arc<str>, fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            cache,
            task: tokio::spawn(fut),
        }
    }

    /// A handle that is already complete
    pub(crate) fn ready(cache: Arc<str>, value: T) -> Self {
        Self::spawn(cache, async move { Ok(value) })
    }

    /// Check whether the load has finished
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<T> Future for LoadHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.task).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(join_error)) => Poll::Ready(Err(Error::LoaderFailure {
                cache: this.cache.to_string(),
                source: anyhow::Error::new(join_error),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wrap a loader error for `cache`
pub(crate) fn loader_failure(cache: &str, source: anyhow::Error) -> Error {
    Error::LoaderFailure {
        cache: cache.to_string(),
        source,
    }
}

// =============================================================================
// Tests
// =============================================================================
