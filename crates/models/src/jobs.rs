use super::JobId;
use chrono::{DateTime, Utc};

/// JobStatus is the OGC status vocabulary of a job's lifecycle.
/// Transitions are `accepted -> running -> {successful, failed}`,
/// and `{accepted, running} -> dismissed`. Terminal states are immutable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Accepted,
    Running,
    Successful,
    Failed,
    Dismissed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Accepted => "accepted",
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Dismissed => "dismissed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Successful | JobStatus::Failed | JobStatus::Dismissed
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(JobStatus::Accepted),
            "running" => Ok(JobStatus::Running),
            "successful" => Ok(JobStatus::Successful),
            "failed" => Ok(JobStatus::Failed),
            "dismissed" => Ok(JobStatus::Dismissed),
            other => Err(format!("{other:?} is not a job status")),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job is one durable row of the job store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Name of the registered process this job executes.
    pub process: String,
    pub status: JobStatus,
    /// Input document, retained bit-for-bit as submitted.
    pub input: serde_json::Value,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// OS process id of the worker child, set once the child is spawned.
    pub child_pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub result: Option<serde_json::Value>,
    pub error: Option<crate::JobError>,
}

impl Job {
    /// The most recent lifecycle timestamp, used for the `updated` field
    /// of job status responses.
    pub fn updated(&self) -> DateTime<Utc> {
        self.end_time
            .or(self.start_time)
            .unwrap_or(self.submit_time)
    }
}

/// LogStream distinguishes the two captured output streams of a job child.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

impl std::str::FromStr for LogStream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            other => Err(format!("{other:?} is not a log stream")),
        }
    }
}
