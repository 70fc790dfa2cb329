//! Durable, locally-embedded store of jobs, their captured logs, and their
//! results. All operations are atomic with respect to concurrent callers:
//! the connection is owned behind a mutex and every multi-statement
//! operation runs inside an IMMEDIATE transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use models::{ErrorKind, Job, JobError, JobId, JobStatus, LogStream};
use rusqlite::OptionalExtension;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

mod schema;

pub use schema::SCHEMA_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} does not exist")]
    NotFound(JobId),
    #[error("job {0} is terminal in status {1} and cannot change")]
    Terminal(JobId, JobStatus),
    #[error("job {id} is in status {actual}, expected {expected}")]
    WrongStatus {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("store schema version {found} is newer than supported version {supported}")]
    Schema { found: i64, supported: i64 },
    #[error("malformed row: {0}")]
    MalformedRow(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Outcome of a dismissal, telling the caller whether a child process
/// must also be signalled.
#[derive(Debug, PartialEq, Eq)]
pub enum Dismissal {
    /// The job had not started; no child exists.
    FromAccepted,
    /// The job was running under the recorded child pid (if one was
    /// recorded yet); the supervisor must be signalled.
    FromRunning { child_pid: Option<u32> },
}

/// Optional filters applied by `list`.
#[derive(Debug, Default, Clone)]
pub struct ListFilter {
    pub process: Option<String>,
    pub status: Option<JobStatus>,
}

/// JobStore is a cheaply clone-able handle over the embedded database.
/// Operations are synchronous; async callers run them on a blocking pool.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl JobStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(path)?;
        Self::attach(conn)
    }

    /// An in-memory store, used by tests and by `serve status`.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::attach(rusqlite::Connection::open_in_memory()?)
    }

    fn attach(conn: rusqlite::Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().expect("job store mutex poisoned")
    }

    /// Insert a new job in status `accepted` and return it.
    /// The input document is retained bit-for-bit.
    pub fn enqueue(
        &self,
        process: &str,
        input: &serde_json::Value,
    ) -> Result<Job, StoreError> {
        let job = Job {
            id: JobId::generate(),
            process: process.to_string(),
            status: JobStatus::Accepted,
            input: input.clone(),
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            child_pid: None,
            exit_code: None,
            result: None,
            error: None,
        };
        let conn = self.lock();
        conn.execute(
            "INSERT INTO jobs (job_id, process, status, input_json, submit_time)
             VALUES (?1, ?2, ?3, ?4, ?5);",
            rusqlite::params![
                job.id.to_string(),
                job.process,
                job.status.as_str(),
                job.input.to_string(),
                time_str(&job.submit_time),
            ],
        )?;
        tracing::debug!(job_id = %job.id, process = %job.process, "enqueued");
        Ok(job)
    }

    /// Transition exactly one `accepted` job to `running` and return it,
    /// or return None when no job is available. Claim order is FIFO by
    /// submit time, with job id as the tiebreak.
    pub fn claim(&self, worker: &str) -> Result<Option<Job>, StoreError> {
        let mut conn = self.lock();
        let txn = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let picked: Option<String> = txn
            .query_row(
                "SELECT job_id FROM jobs WHERE status = 'accepted'
                 ORDER BY submit_time, job_id LIMIT 1;",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(job_id) = picked else {
            return Ok(None);
        };
        let updated = txn.execute(
            "UPDATE jobs SET status = 'running' WHERE job_id = ?1 AND status = 'accepted';",
            rusqlite::params![job_id],
        )?;
        // The guard cannot fail under the connection mutex, but the claim
        // must still be observed by at most one worker if it ever does.
        if updated != 1 {
            txn.rollback()?;
            return Ok(None);
        }
        let job = read_job(&txn, &job_id)?.ok_or(StoreError::MalformedRow(job_id))?;
        txn.commit()?;

        tracing::debug!(job_id = %job.id, process = %job.process, %worker, "claimed");
        Ok(Some(job))
    }

    /// Record the child pid and start time of a claimed job.
    pub fn mark_started(&self, id: JobId, pid: u32) -> Result<(), StoreError> {
        let conn = self.lock();
        let job = read_job(&conn, &id.to_string())?.ok_or(StoreError::NotFound(id))?;
        if job.status != JobStatus::Running {
            return Err(StoreError::WrongStatus {
                id,
                expected: JobStatus::Running,
                actual: job.status,
            });
        }
        conn.execute(
            "UPDATE jobs SET child_pid = ?2, start_time = ?3 WHERE job_id = ?1;",
            rusqlite::params![id.to_string(), pid, time_str(&Utc::now())],
        )?;
        Ok(())
    }

    /// Append one captured log chunk. Chunks preserve per-stream append
    /// order; there is no ordering constraint across streams.
    pub fn append_log(&self, id: JobId, stream: LogStream, text: &str) -> Result<(), StoreError> {
        self.append_log_batch(&[(id, stream, text.to_string())])
    }

    /// Append many chunks inside a single transaction.
    pub fn append_log_batch(
        &self,
        chunks: &[(JobId, LogStream, String)],
    ) -> Result<(), StoreError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let txn = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        {
            let mut stmt = txn.prepare_cached(
                "INSERT INTO job_logs (job_id, stream, chunk_index, text)
                 SELECT ?1, ?2,
                        1 + COALESCE(MAX(chunk_index), 0),
                        ?3
                 FROM job_logs WHERE job_id = ?1 AND stream = ?2;",
            )?;
            for (id, stream, text) in chunks {
                stmt.execute(rusqlite::params![id.to_string(), stream.as_str(), text])?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// The job's captured output, concatenated in append order.
    pub fn logs(&self, id: JobId) -> Result<String, StoreError> {
        let conn = self.lock();
        if read_job(&conn, &id.to_string())?.is_none() {
            return Err(StoreError::NotFound(id));
        }
        let mut stmt = conn.prepare_cached(
            "SELECT text FROM job_logs WHERE job_id = ?1 ORDER BY rowid;",
        )?;
        let mut out = String::new();
        let mut rows = stmt.query(rusqlite::params![id.to_string()])?;
        while let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            out.push_str(&text);
            out.push('\n');
        }
        Ok(out)
    }

    /// Transition `running -> successful | failed`, recording the exit code,
    /// the end time, and the result or error document.
    pub fn complete(
        &self,
        id: JobId,
        exit_code: i32,
        outcome: Result<serde_json::Value, JobError>,
    ) -> Result<Job, StoreError> {
        let mut conn = self.lock();
        let txn = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let job = read_job(&txn, &id.to_string())?.ok_or(StoreError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(StoreError::Terminal(id, job.status));
        }
        if job.status != JobStatus::Running {
            return Err(StoreError::WrongStatus {
                id,
                expected: JobStatus::Running,
                actual: job.status,
            });
        }

        let (status, result_json, error_json) = match &outcome {
            Ok(result) => (JobStatus::Successful, Some(result.to_string()), None),
            Err(err) => (
                JobStatus::Failed,
                None,
                Some(serde_json::to_string(err).expect("JobError serializes")),
            ),
        };
        txn.execute(
            "UPDATE jobs SET status = ?2, exit_code = ?3, end_time = ?4,
                             result_json = ?5, error_json = ?6
             WHERE job_id = ?1;",
            rusqlite::params![
                id.to_string(),
                status.as_str(),
                exit_code,
                time_str(&Utc::now()),
                result_json,
                error_json,
            ],
        )?;
        let job = read_job(&txn, &id.to_string())?.ok_or(StoreError::NotFound(id))?;
        txn.commit()?;

        tracing::debug!(job_id = %id, status = %status, exit_code, "completed");
        Ok(job)
    }

    /// Transition `accepted | running -> dismissed`. The caller is told
    /// whether a running child must also be signalled; this call never
    /// waits on the child.
    pub fn dismiss(&self, id: JobId) -> Result<Dismissal, StoreError> {
        let mut conn = self.lock();
        let txn = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let job = read_job(&txn, &id.to_string())?.ok_or(StoreError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(StoreError::Terminal(id, job.status));
        }
        let dismissal = match job.status {
            JobStatus::Accepted => Dismissal::FromAccepted,
            JobStatus::Running => Dismissal::FromRunning {
                child_pid: job.child_pid,
            },
            _ => unreachable!("non-terminal states are accepted or running"),
        };

        // The row is terminal as of this transition, so it gets an end
        // time now; for a running job the supervisor overwrites it (and
        // the exit code) once the child has actually terminated.
        let error = JobError::new(ErrorKind::Dismissed, "job was dismissed");
        txn.execute(
            "UPDATE jobs SET status = 'dismissed', end_time = ?2, error_json = ?3
             WHERE job_id = ?1;",
            rusqlite::params![
                id.to_string(),
                time_str(&Utc::now()),
                serde_json::to_string(&error).expect("JobError serializes"),
            ],
        )?;
        txn.commit()?;

        tracing::info!(job_id = %id, ?dismissal, "dismissed");
        Ok(dismissal)
    }

    /// Record the final exit code and error document of a dismissed job,
    /// once its child has actually terminated.
    pub fn finish_dismissed(
        &self,
        id: JobId,
        exit_code: i32,
        error: &JobError,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE jobs SET exit_code = ?2, end_time = ?3, error_json = ?4
             WHERE job_id = ?1 AND status = 'dismissed';",
            rusqlite::params![
                id.to_string(),
                exit_code,
                time_str(&Utc::now()),
                serde_json::to_string(error).expect("JobError serializes"),
            ],
        )?;
        if updated != 1 {
            let job = read_job(&conn, &id.to_string())?.ok_or(StoreError::NotFound(id))?;
            return Err(StoreError::WrongStatus {
                id,
                expected: JobStatus::Dismissed,
                actual: job.status,
            });
        }
        Ok(())
    }

    pub fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let conn = self.lock();
        read_job(&conn, &id.to_string())?.ok_or(StoreError::NotFound(id))
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Job>, StoreError> {
        let conn = self.lock();
        let mut sql = String::from(
            "SELECT job_id, process, status, input_json, submit_time, start_time,
                    end_time, child_pid, exit_code, result_json, error_json
             FROM jobs WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();
        if let Some(process) = &filter.process {
            sql.push_str(" AND process = ?");
            params.push(process.clone());
        }
        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            params.push(status.as_str().to_string());
        }
        sql.push_str(" ORDER BY submit_time, job_id;");

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(job_from_row(row)?);
        }
        Ok(jobs)
    }

    /// Delete terminal jobs (and their logs) whose end time is before the
    /// cutoff. Returns the number of jobs removed.
    pub fn purge(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut conn = self.lock();
        let txn = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        txn.execute(
            "DELETE FROM job_logs WHERE job_id IN
               (SELECT job_id FROM jobs
                WHERE status IN ('successful', 'failed', 'dismissed')
                  AND end_time < ?1);",
            rusqlite::params![time_str(&before)],
        )?;
        let purged = txn.execute(
            "DELETE FROM jobs
             WHERE status IN ('successful', 'failed', 'dismissed')
               AND end_time < ?1;",
            rusqlite::params![time_str(&before)],
        )?;
        txn.commit()?;
        Ok(purged)
    }

    /// Read a scheduler-state value from the metadata table.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1;",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn put_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value;",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }
}

fn time_str(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| StoreError::MalformedRow(format!("bad timestamp {s:?}: {err}")))
}

fn read_job(conn: &rusqlite::Connection, id: &str) -> Result<Option<Job>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT job_id, process, status, input_json, submit_time, start_time,
                end_time, child_pid, exit_code, result_json, error_json
         FROM jobs WHERE job_id = ?1;",
    )?;
    let mut rows = stmt.query(rusqlite::params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(job_from_row(row)?)),
        None => Ok(None),
    }
}

fn job_from_row(row: &rusqlite::Row<'_>) -> Result<Job, StoreError> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    let input_json: String = row.get(3)?;
    let submit_time: String = row.get(4)?;
    let start_time: Option<String> = row.get(5)?;
    let end_time: Option<String> = row.get(6)?;
    let result_json: Option<String> = row.get(9)?;
    let error_json: Option<String> = row.get(10)?;

    let bad = |what: &str, err: &dyn std::fmt::Display| {
        StoreError::MalformedRow(format!("job {id}: bad {what}: {err}"))
    };

    Ok(Job {
        id: id.parse().map_err(|e| bad("job_id", &e))?,
        process: row.get(1)?,
        status: status.parse().map_err(|e: String| bad("status", &e))?,
        input: serde_json::from_str(&input_json).map_err(|e| bad("input_json", &e))?,
        submit_time: parse_time(&submit_time)?,
        start_time: start_time.as_deref().map(parse_time).transpose()?,
        end_time: end_time.as_deref().map(parse_time).transpose()?,
        child_pid: row.get(7)?,
        exit_code: row.get(8)?,
        result: result_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| bad("result_json", &e))?,
        error: error_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| bad("error_json", &e))?,
    })
}

#[cfg(test)]
mod test;
