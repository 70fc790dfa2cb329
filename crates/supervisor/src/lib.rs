//! Runs one job as an isolated OS child process: spawns it, streams its
//! stdout and stderr into the job store, harvests its result or error
//! document from its final output line, and delivers terminate-then-kill
//! cancellation when the job is dismissed.

use job_store::{JobStore, StoreError};
use models::{ErrorKind, Job, JobError, JobId, JobStatus, LogStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub mod logs;
pub mod process;

pub use process::Command;

/// Default window between the terminate and kill signals of a dismissal.
pub const DEFAULT_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

/// CancelSet is the in-process registry through which a dismissal reaches
/// the supervisor of a running job. The HTTP surface fires it after the
/// store transition commits; the response never waits for the child.
#[derive(Clone, Default)]
pub struct CancelSet {
    inner: Arc<Mutex<HashMap<JobId, tokio::sync::oneshot::Sender<()>>>>,
}

impl CancelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running job, returning the receiver its supervisor
    /// selects on.
    pub fn register(&self, id: JobId) -> tokio::sync::oneshot::Receiver<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.inner.lock().unwrap().insert(id, tx);
        rx
    }

    /// Signal the job's supervisor, if the job is currently running here.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.inner.lock().unwrap().remove(&id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    fn deregister(&self, id: JobId) {
        self.inner.lock().unwrap().remove(&id);
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    Dismissed { exit_code: i32 },
}

/// Supervise one claimed job end-to-end: spawn `cmd`, capture its output,
/// wait for exit or dismissal, and record the terminal row.
#[tracing::instrument(err, skip_all, fields(job_id = %job.id, process = %job.process))]
pub async fn supervise(
    store: JobStore,
    logs_tx: logs::Tx,
    cancels: CancelSet,
    job: Job,
    mut cmd: process::Command,
    grace: std::time::Duration,
) -> anyhow::Result<()> {
    let job_id = job.id;
    // Register for cancellation before the child exists, so a dismissal
    // arriving the instant the pid is recorded cannot slip past us.
    let cancel_rx = cancels.register(job_id);

    let mut child = match process::Child::spawn(&mut cmd) {
        Ok(child) => child,
        Err(err) => {
            cancels.deregister(job_id);
            let error = JobError::new(ErrorKind::Internal, format!("failed to spawn: {err}"))
                .with_traceback(format!("{err:?}"));
            blocking(&store, move |s| s.complete(job_id, 1, Err(error))).await??;
            return Ok(());
        }
    };
    let pid = child.id();
    match blocking(&store, move |s| s.mark_started(job_id, pid)).await? {
        Ok(()) => {}
        // Dismissed between claim and spawn: reap the child and finalize.
        Err(StoreError::WrongStatus {
            actual: JobStatus::Dismissed,
            ..
        }) => {
            cancels.deregister(job_id);
            child.kill()?;
            let _ = child.wait().await;
            let error = JobError::new(ErrorKind::Dismissed, "terminated after dismissal");
            blocking(&store, move |s| s.finish_dismissed(job_id, -1, &error)).await??;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    }

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");

    let out_fut = logs::capture_lines(logs_tx.clone(), job_id, LogStream::Stdout, stdout);
    let err_fut = logs::capture_lines(logs_tx.clone(), job_id, LogStream::Stderr, stderr);

    let wait_fut = async {
        tokio::select! {
            status = child.wait() => Ok::<WaitOutcome, anyhow::Error>(WaitOutcome::Exited(status?)),
            _ = cancel_rx => {
                tracing::info!(pid, "dismissal signalled; terminating child");
                child.terminate()?;
                let status = match tokio::time::timeout(grace, child.wait()).await {
                    Ok(status) => status?,
                    Err(_elapsed) => {
                        tracing::warn!(pid, "grace window expired; killing child");
                        child.kill()?;
                        child.wait().await?
                    }
                };
                tracing::debug!(pid, ?status, "dismissed child exited");
                Ok(WaitOutcome::Dismissed { exit_code: -1 })
            }
        }
    };

    let (last_out, last_err, outcome) = futures::try_join!(
        async { out_fut.await.map_err(anyhow::Error::from) },
        async { err_fut.await.map_err(anyhow::Error::from) },
        async { wait_fut.await.map_err(anyhow::Error::from) },
    )?;
    cancels.deregister(job_id);

    match outcome {
        WaitOutcome::Dismissed { exit_code } => {
            let error = JobError::new(ErrorKind::Dismissed, "terminated after dismissal");
            blocking(&store, move |s| s.finish_dismissed(job_id, exit_code, &error)).await??;
        }
        WaitOutcome::Exited(status) => {
            let exit_code = process::exit_code(status);
            let outcome = harvest(exit_code, last_out, last_err);
            let recorded =
                blocking(&store, move |s| s.complete(job_id, exit_code, outcome)).await?;
            match recorded {
                Ok(_) => {}
                // The job was dismissed while the child was already exiting;
                // the dismissal wins and the exit code is recorded against it.
                Err(StoreError::Terminal(_, JobStatus::Dismissed)) => {
                    let error = JobError::new(ErrorKind::Dismissed, "terminated after dismissal");
                    blocking(&store, move |s| {
                        s.finish_dismissed(job_id, exit_code, &error)
                    })
                    .await??;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

/// Interpret the child's final output lines as its result or error document.
fn harvest(
    exit_code: i32,
    last_out: Option<String>,
    last_err: Option<String>,
) -> Result<serde_json::Value, JobError> {
    if exit_code == 0 {
        match last_out
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
        {
            Some(Ok(doc)) if doc.is_object() => Ok(doc),
            _ => Err(JobError::internal(format!(
                "child exited 0 without a parseable result document; final stdout: {:?}",
                last_out.unwrap_or_default()
            ))),
        }
    } else {
        match last_err.as_deref().map(serde_json::from_str::<JobError>) {
            Some(Ok(doc)) => Err(doc),
            _ => Err(JobError::internal(format!(
                "child exited {exit_code}; final stderr: {:?}",
                last_err.unwrap_or_default()
            ))),
        }
    }
}

async fn blocking<T, F>(store: &JobStore, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&JobStore) -> T + Send + 'static,
{
    let store = store.clone();
    Ok(tokio::task::spawn_blocking(move || f(&store)).await?)
}

#[cfg(test)]
mod test;
