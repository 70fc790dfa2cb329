use super::StoreError;

/// Version of the on-disk schema this build reads and writes.
/// Opening a store written by a newer build fails rather than corrupting it.
pub const SCHEMA_VERSION: i64 = 1;

pub fn init(conn: &rusqlite::Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "BEGIN;
         CREATE TABLE IF NOT EXISTS jobs (
             job_id       TEXT PRIMARY KEY NOT NULL,
             process      TEXT NOT NULL,
             status       TEXT NOT NULL,
             input_json   TEXT NOT NULL,
             submit_time  TEXT NOT NULL,
             start_time   TEXT,
             end_time     TEXT,
             child_pid    INTEGER,
             exit_code    INTEGER,
             result_json  TEXT,
             error_json   TEXT
         );
         CREATE INDEX IF NOT EXISTS jobs_status_submit ON jobs (status, submit_time);

         CREATE TABLE IF NOT EXISTS job_logs (
             job_id       TEXT NOT NULL REFERENCES jobs (job_id) ON DELETE CASCADE,
             stream       TEXT NOT NULL,
             chunk_index  INTEGER NOT NULL,
             text         TEXT NOT NULL,
             PRIMARY KEY (job_id, stream, chunk_index)
         );

         CREATE TABLE IF NOT EXISTS metadata (
             key    TEXT PRIMARY KEY NOT NULL,
             value  TEXT NOT NULL
         );
         COMMIT;",
    )?;

    let found: Option<String> = {
        use rusqlite::OptionalExtension;
        conn.query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version';",
            [],
            |row| row.get(0),
        )
        .optional()?
    };
    match found {
        None => {
            conn.execute(
                "INSERT INTO metadata (key, value) VALUES ('schema_version', ?1);",
                rusqlite::params![SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        }
        Some(v) => {
            let found: i64 = v
                .parse()
                .map_err(|_| StoreError::MalformedRow(format!("schema_version {v:?}")))?;
            if found > SCHEMA_VERSION {
                Err(StoreError::Schema {
                    found,
                    supported: SCHEMA_VERSION,
                })
            } else {
                Ok(())
            }
        }
    }
}
