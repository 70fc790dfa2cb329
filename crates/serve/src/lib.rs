//! The long-running service: an OGC-shaped HTTP surface over the job
//! store and process registry, plus the bounded worker pool that drains
//! the queue into supervised child processes.

use job_store::JobStore;
use registry::Registry;
use std::sync::Arc;
use supervisor::CancelSet;

pub mod api;
pub mod invoke;
pub mod pool;

/// Shared state of the HTTP surface and the worker pool.
pub struct App {
    pub store: JobStore,
    pub registry: Registry,
    pub cancels: CancelSet,
    /// Poked on enqueue so idle workers claim without waiting out the poll
    /// interval.
    pub wake: Arc<tokio::sync::Notify>,
}

impl App {
    pub fn new(store: JobStore, registry: Registry) -> Arc<App> {
        Arc::new(App {
            store,
            registry,
            cancels: CancelSet::new(),
            wake: Arc::new(tokio::sync::Notify::new()),
        })
    }
}

/// Run a synchronous job-store operation on the blocking pool.
pub(crate) async fn blocking<T, F>(store: &JobStore, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&JobStore) -> T + Send + 'static,
{
    let store = store.clone();
    Ok(tokio::task::spawn_blocking(move || f(&store)).await?)
}

#[cfg(test)]
mod e2e;
