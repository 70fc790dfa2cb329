//! The bounded worker pool: N tokio tasks, each looping claim -> supervise.
//! Fairness is FIFO by submit time (the claim order of the store); the only
//! cross-job resource rule, one job per submodel directory, is enforced by
//! the advisory lock inside the stage entrypoint.

use crate::App;
use models::Job;
use std::sync::Arc;
use supervisor::{logs, process::Command};

/// Builds the child command for one claimed job. Production re-invokes the
/// service binary's hidden `invoke` subcommand; tests substitute scripts.
pub type CommandFactory = Arc<dyn Fn(&Job) -> Command + Send + Sync>;

#[derive(Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub poll_interval: std::time::Duration,
    /// Window between terminate and kill on dismissal.
    pub grace: std::time::Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval: std::time::Duration::from_millis(500),
            grace: supervisor::DEFAULT_GRACE,
        }
    }
}

/// `max(cores - 2, 1)`.
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.saturating_sub(2).max(1)
}

pub struct WorkerPool {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Start N workers draining the queue. With zero workers jobs stay
    /// `accepted` until a pool with workers starts.
    pub fn start(
        app: Arc<App>,
        logs_tx: logs::Tx,
        factory: CommandFactory,
        config: PoolConfig,
    ) -> WorkerPool {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handles = (0..config.workers)
            .map(|index| {
                let app = app.clone();
                let logs_tx = logs_tx.clone();
                let factory = factory.clone();
                let config = config.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(worker_loop(index, app, logs_tx, factory, config, shutdown_rx))
            })
            .collect();
        WorkerPool {
            shutdown_tx,
            handles,
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop claiming and wait up to `grace` for in-flight jobs to finish.
    pub async fn shutdown(self, grace: std::time::Duration) {
        let _ = self.shutdown_tx.send(true);
        let drain = futures::future::join_all(self.handles);
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("worker pool did not drain within the shutdown grace window");
        }
    }
}

#[tracing::instrument(skip_all, fields(worker = index))]
async fn worker_loop(
    index: usize,
    app: Arc<App>,
    logs_tx: logs::Tx,
    factory: CommandFactory,
    config: PoolConfig,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let worker = format!("worker-{index}");
    loop {
        if *shutdown_rx.borrow() {
            tracing::debug!("worker exiting");
            return;
        }

        let claimed = {
            let store = app.store.clone();
            let worker = worker.clone();
            tokio::task::spawn_blocking(move || store.claim(&worker)).await
        };
        let claimed = match claimed {
            Ok(Ok(claimed)) => claimed,
            Ok(Err(err)) => {
                tracing::error!(?err, "claim failed; backing off");
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
            Err(join_err) => {
                tracing::error!(?join_err, "claim task panicked");
                continue;
            }
        };

        match claimed {
            Some(job) => {
                let cmd = factory(&job);
                if let Err(err) = supervisor::supervise(
                    app.store.clone(),
                    logs_tx.clone(),
                    app.cancels.clone(),
                    job,
                    cmd,
                    config.grace,
                )
                .await
                {
                    tracing::error!(?err, "supervision failed");
                }
            }
            None => {
                // Idle: wait for an enqueue wake-up, bounded by the poll
                // interval so missed notifications cannot strand a job.
                tokio::select! {
                    _ = app.wake.notified() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }
}
