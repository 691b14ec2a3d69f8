//! User-supplied `project` / `collect` callables
//!
//! A hook declares at registration time whether it blocks. Blocking hooks
//! run on the [`WorkerPool`] when one is configured; async hooks are awaited
//! directly.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::pool::WorkerPool;
use crate::error::{RelayError, Result};
use crate::types::Event;

/// A blocking or asynchronous callable over an event
pub enum Hook<T> {
    Blocking(Arc<dyn Fn(Event) -> T + Send + Sync>),
    Async(Arc<dyn Fn(Event) -> BoxFuture<'static, T> + Send + Sync>),
}

/// Transform applied before any sink; `None` drops the event
pub type Project = Hook<Option<Event>>;

/// Final sink, e.g. the console
pub type Collect = Hook<()>;

impl<T> Clone for Hook<T> {
    fn clone(&self) -> Self {
        match self {
            Hook::Blocking(f) => Hook::Blocking(f.clone()),
            Hook::Async(f) => Hook::Async(f.clone()),
        }
    }
}

impl<T: Send + 'static> Hook<T> {
    /// Wrap an ordinary blocking function
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Event) -> T + Send + Sync + 'static,
    {
        Hook::Blocking(Arc::new(f))
    }

    /// Wrap an async function
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Hook::Async(Arc::new(move |event| f(event).boxed()))
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Hook::Blocking(_))
    }

    /// Invoke the hook; blocking hooks go to `pool` when given
    pub async fn call(&self, event: Event, pool: Option<&WorkerPool>) -> Result<T> {
        match self {
            Hook::Async(f) => AssertUnwindSafe(f(event))
                .catch_unwind()
                .await
                .map_err(|_| RelayError::Internal("async hook panicked".to_string())),
            Hook::Blocking(f) => match pool {
                Some(pool) => {
                    let f = f.clone();
                    pool.submit(move || f(event)).await
                }
                None => catch_unwind(AssertUnwindSafe(|| f(event)))
                    .map_err(|_| RelayError::Internal("blocking hook panicked".to_string())),
            },
        }
    }
}

/// Default `collect` when no backend log is configured: one JSON line per event
pub fn console_collect() -> Collect {
    Hook::blocking(|event| match serde_json::to_string(&event) {
        Ok(line) => tracing::info!(target: "fsrelay::events", "{}", line),
        Err(e) => tracing::warn!(error = %e, "failed to encode event for console"),
    })
}
