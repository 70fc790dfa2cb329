use super::{Dismissal, JobStore, ListFilter, StoreError};
use models::{ErrorKind, JobError, JobStatus, LogStream};

fn store() -> JobStore {
    JobStore::in_memory().unwrap()
}

#[test]
fn test_enqueue_then_claim_preserves_input() {
    let store = store();
    let input = serde_json::json!({
        "source_model_directory": "/data/Baxter",
        "crs": "EPSG:2227",
        "flows": [93.6, 12500.0],
        "nested": {"eclipsed": false, "ratio": 0.30000000000000004},
    });

    let enqueued = store.enqueue("ras_to_gpkg", &input).unwrap();
    assert_eq!(enqueued.status, JobStatus::Accepted);

    let claimed = store.claim("worker-0").unwrap().unwrap();
    assert_eq!(claimed.id, enqueued.id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.input, input);
}

#[test]
fn test_claim_is_fifo_by_submit_time() {
    let store = store();
    let first = store.enqueue("conflate_model", &serde_json::json!({"n": 1})).unwrap();
    let second = store.enqueue("conflate_model", &serde_json::json!({"n": 2})).unwrap();
    let third = store.enqueue("extract_submodel", &serde_json::json!({"n": 3})).unwrap();

    assert_eq!(store.claim("w").unwrap().unwrap().id, first.id);
    assert_eq!(store.claim("w").unwrap().unwrap().id, second.id);
    assert_eq!(store.claim("w").unwrap().unwrap().id, third.id);
    assert!(store.claim("w").unwrap().is_none());
}

#[test]
fn test_claim_is_at_most_once_across_threads() {
    let store = JobStore::open(tempfile::NamedTempFile::new().unwrap().path()).unwrap();
    for i in 0..32 {
        store.enqueue("test_job_queue", &serde_json::json!({ "i": i })).unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let store = store.clone();
        handles.push(std::thread::spawn(move || {
            let mut claimed = Vec::new();
            while let Some(job) = store.claim(&format!("worker-{w}")).unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }
    let mut all: Vec<_> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 32, "every job is claimed");
    assert_eq!(all.len(), 32, "no job is claimed twice");
}

#[test]
fn test_jobs_wait_without_claimers() {
    let store = store();
    store.enqueue("test_job_queue", &serde_json::json!({})).unwrap();
    let jobs = store.list(&ListFilter::default()).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Accepted);
}

#[test]
fn test_lifecycle_success() {
    let store = store();
    store.enqueue("create_fim_lib", &serde_json::json!({})).unwrap();
    let job = store.claim("w").unwrap().unwrap();
    store.mark_started(job.id, 4242).unwrap();

    let result = serde_json::json!({"grids": 12});
    let done = store.complete(job.id, 0, Ok(result.clone())).unwrap();

    assert_eq!(done.status, JobStatus::Successful);
    assert_eq!(done.exit_code, Some(0));
    assert_eq!(done.child_pid, Some(4242));
    assert_eq!(done.result, Some(result));
    assert!(done.start_time.is_some());
    assert!(done.end_time.is_some());
}

#[test]
fn test_lifecycle_failure() {
    let store = store();
    store.enqueue("create_ras_terrain", &serde_json::json!({})).unwrap();
    let job = store.claim("w").unwrap().unwrap();

    let err = JobError::new(ErrorKind::TerrainOutOfBounds, "DEM does not cover reach");
    let done = store.complete(job.id, 1, Err(err.clone())).unwrap();

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error, Some(err));
    assert!(done.end_time.is_some());
}

#[test]
fn test_mark_started_requires_running() {
    let store = store();
    let job = store.enqueue("test_job_queue", &serde_json::json!({})).unwrap();
    assert!(matches!(
        store.mark_started(job.id, 1),
        Err(StoreError::WrongStatus { .. })
    ));
}

#[test]
fn test_terminal_states_are_immutable() {
    let store = store();
    store.enqueue("test_job_queue", &serde_json::json!({})).unwrap();
    let job = store.claim("w").unwrap().unwrap();
    store.complete(job.id, 0, Ok(serde_json::json!({}))).unwrap();

    assert!(matches!(
        store.complete(job.id, 0, Ok(serde_json::json!({}))),
        Err(StoreError::WrongStatus { .. }) | Err(StoreError::Terminal(..))
    ));
    assert!(matches!(
        store.dismiss(job.id),
        Err(StoreError::Terminal(..))
    ));
}

#[test]
fn test_dismiss_accepted_is_terminal_immediately() {
    let store = store();
    let job = store.enqueue("run_known_wse", &serde_json::json!({})).unwrap();

    assert_eq!(store.dismiss(job.id).unwrap(), Dismissal::FromAccepted);
    let job = store.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Dismissed);
    assert!(job.end_time.is_some());
    assert_eq!(job.error.as_ref().unwrap().kind, ErrorKind::Dismissed);
    // No child was ever spawned.
    assert_eq!(job.child_pid, None);
}

#[test]
fn test_dismiss_running_reports_child_pid() {
    let store = store();
    store.enqueue("run_incremental_normal_depth", &serde_json::json!({})).unwrap();
    let job = store.claim("w").unwrap().unwrap();
    store.mark_started(job.id, 777).unwrap();

    assert_eq!(
        store.dismiss(job.id).unwrap(),
        Dismissal::FromRunning {
            child_pid: Some(777)
        }
    );
    // The supervisor later records the final exit code.
    store
        .finish_dismissed(job.id, -1, &JobError::new(ErrorKind::Dismissed, "terminated"))
        .unwrap();
    let job = store.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Dismissed);
    assert_eq!(job.exit_code, Some(-1));
    assert!(job.end_time.is_some());
}

#[test]
fn test_logs_concatenate_in_append_order() {
    let store = store();
    store.enqueue("test_job_queue", &serde_json::json!({})).unwrap();
    let job = store.claim("w").unwrap().unwrap();

    store.append_log(job.id, LogStream::Stdout, "reading geometry").unwrap();
    store.append_log(job.id, LogStream::Stderr, "warn: no junctions").unwrap();
    store.append_log(job.id, LogStream::Stdout, "wrote 42 sections").unwrap();

    assert_eq!(
        store.logs(job.id).unwrap(),
        "reading geometry\nwarn: no junctions\nwrote 42 sections\n"
    );
}

#[test]
fn test_logs_of_unknown_job() {
    let store = store();
    assert!(matches!(
        store.logs(models::JobId::generate()),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn test_list_filters() {
    let store = store();
    store.enqueue("ras_to_gpkg", &serde_json::json!({})).unwrap();
    store.enqueue("conflate_model", &serde_json::json!({})).unwrap();
    store.claim("w").unwrap().unwrap();

    let by_process = store
        .list(&ListFilter {
            process: Some("conflate_model".to_string()),
            status: None,
        })
        .unwrap();
    assert_eq!(by_process.len(), 1);

    let by_status = store
        .list(&ListFilter {
            process: None,
            status: Some(JobStatus::Running),
        })
        .unwrap();
    assert_eq!(by_status.len(), 1);
    assert_eq!(by_status[0].process, "ras_to_gpkg");
}

#[test]
fn test_purge_removes_only_old_terminal_jobs() {
    let store = store();
    store.enqueue("test_job_queue", &serde_json::json!({})).unwrap();
    let done = store.claim("w").unwrap().unwrap();
    store.complete(done.id, 0, Ok(serde_json::json!({}))).unwrap();
    let live = store.enqueue("test_job_queue", &serde_json::json!({})).unwrap();

    let purged = store
        .purge(chrono::Utc::now() + chrono::Duration::seconds(1))
        .unwrap();
    assert_eq!(purged, 1);
    assert!(matches!(store.get(done.id), Err(StoreError::NotFound(_))));
    assert!(store.get(live.id).is_ok());
}

#[test]
fn test_reopen_preserves_jobs() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let job_id = {
        let store = JobStore::open(file.path()).unwrap();
        store.enqueue("conflate_model", &serde_json::json!({"keep": true})).unwrap().id
    };
    let store = JobStore::open(file.path()).unwrap();
    let job = store.get(job_id).unwrap();
    assert_eq!(job.input, serde_json::json!({"keep": true}));
    assert_eq!(job.status, JobStatus::Accepted);
}

#[test]
fn test_metadata_round_trip() {
    let store = store();
    assert_eq!(store.get_meta("cursor").unwrap(), None);
    store.put_meta("cursor", "42").unwrap();
    store.put_meta("cursor", "43").unwrap();
    assert_eq!(store.get_meta("cursor").unwrap(), Some("43".to_string()));
    assert_eq!(store.get_meta("schema_version").unwrap(), Some("1".to_string()));
}
