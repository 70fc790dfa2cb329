//! A child-process wrapper that supports waiting from async tasks while a
//! different task delivers signals. The tokio `process` feature is avoided
//! deliberately (see the workspace manifest); instead the child's pipes are
//! adopted as tokio files and waits run on the blocking pool.

pub use std::process::Command;

use std::os::fd::OwnedFd;
use std::sync::Arc;

pub type ChildStdio = tokio::fs::File;

pub struct Child {
    shared: Arc<shared_child::SharedChild>,

    pub stdout: Option<ChildStdio>,
    pub stderr: Option<ChildStdio>,
}

impl Child {
    /// Spawn `cmd` with stdout and stderr piped and stdin closed.
    pub fn spawn(cmd: &mut Command) -> std::io::Result<Child> {
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        tracing::debug!(program = ?cmd.get_program(), args = ?cmd.get_args().collect::<Vec<_>>(), "invoking");

        let shared = shared_child::SharedChild::spawn(cmd)?;
        let stdout = map_stdio(shared.take_stdout());
        let stderr = map_stdio(shared.take_stderr());

        Ok(Child {
            shared: Arc::new(shared),
            stdout,
            stderr,
        })
    }

    pub fn id(&self) -> u32 {
        self.shared.id()
    }

    /// Wait for the child to exit. May be called concurrently and repeatedly;
    /// every call observes the same exit status.
    pub async fn wait(&self) -> std::io::Result<std::process::ExitStatus> {
        let shared = self.shared.clone();
        tokio::runtime::Handle::current()
            .spawn_blocking(move || shared.wait())
            .await
            .expect("wait does not panic")
    }

    /// Deliver the platform's terminate signal, asking the child to exit.
    /// A no-op if the child has already been reaped.
    pub fn terminate(&self) -> std::io::Result<()> {
        if self.shared.try_wait()?.is_some() {
            return Ok(());
        }
        let rc = unsafe { libc::kill(self.shared.id() as libc::pid_t, libc::SIGTERM) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            // ESRCH means the child exited between try_wait and kill.
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Deliver the kill signal. Safe to call after the child exited.
    pub fn kill(&self) -> std::io::Result<()> {
        self.shared.kill()
    }
}

fn map_stdio<F>(f: Option<F>) -> Option<ChildStdio>
where
    F: Into<OwnedFd>,
{
    let f: Option<OwnedFd> = f.map(Into::into);
    let f: Option<std::fs::File> = f.map(Into::into);
    f.map(Into::into)
}

/// Map an exit status to the exit code recorded on the job: the plain code
/// when the child exited, or 64 plus the signal number when it was killed.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => code,
        None => 64 + status.signal().unwrap_or(0),
    }
}
