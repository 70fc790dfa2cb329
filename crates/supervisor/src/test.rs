use super::{harvest, logs, process, supervise, CancelSet};
use job_store::JobStore;
use models::{ErrorKind, JobStatus};

fn sh(script: &str) -> process::Command {
    let mut cmd = process::Command::new("/bin/sh");
    cmd.arg("-c").arg(script);
    cmd
}

struct Fixture {
    store: JobStore,
    cancels: CancelSet,
    logs_tx: logs::Tx,
    sink: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Fixture {
    fn new() -> Self {
        let store = JobStore::in_memory().unwrap();
        let (logs_tx, logs_rx) = tokio::sync::mpsc::channel(logs::CHANNEL_DEPTH);
        let sink = tokio::spawn(logs::serve_sink(store.clone(), logs_rx));
        Self {
            store,
            cancels: CancelSet::new(),
            logs_tx,
            sink,
        }
    }

    fn claim(&self, process: &str) -> models::Job {
        self.store.enqueue(process, &serde_json::json!({})).unwrap();
        self.store.claim("test-worker").unwrap().unwrap()
    }

    async fn finish(self) -> JobStore {
        std::mem::drop(self.logs_tx);
        self.sink.await.unwrap().unwrap();
        self.store
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_successful_child_records_result() {
    let fx = Fixture::new();
    let job = fx.claim("test_job_queue");
    let id = job.id;

    supervise(
        fx.store.clone(),
        fx.logs_tx.clone(),
        fx.cancels.clone(),
        job,
        sh("echo reading; echo '{\"answer\": 42}'"),
        super::DEFAULT_GRACE,
    )
    .await
    .unwrap();

    let store = fx.finish().await;
    let job = store.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Successful);
    assert_eq!(job.exit_code, Some(0));
    assert!(job.child_pid.is_some());
    assert_eq!(job.result, Some(serde_json::json!({"answer": 42})));
    assert_eq!(store.logs(id).unwrap(), "reading\n{\"answer\": 42}\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_child_records_error_document() {
    let fx = Fixture::new();
    let job = fx.claim("create_model_run_normal_depth");
    let id = job.id;

    supervise(
        fx.store.clone(),
        fx.logs_tx.clone(),
        fx.cancels.clone(),
        job,
        sh("echo solving >&2; echo '{\"kind\":\"SolverCrash\",\"detail\":\"exit 9\"}' >&2; exit 3"),
        super::DEFAULT_GRACE,
    )
    .await
    .unwrap();

    let job = fx.finish().await.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.exit_code, Some(3));
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::SolverCrash);
    assert_eq!(error.detail, "exit 9");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unparseable_tail_synthesizes_internal_error() {
    let fx = Fixture::new();
    let job = fx.claim("test_job_queue");
    let id = job.id;

    supervise(
        fx.store.clone(),
        fx.logs_tx.clone(),
        fx.cancels.clone(),
        job,
        sh("echo 'not json' >&2; exit 7"),
        super::DEFAULT_GRACE,
    )
    .await
    .unwrap();

    let job = fx.finish().await.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.exit_code, Some(7));
    assert_eq!(job.error.unwrap().kind, ErrorKind::Internal);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exit_zero_without_result_document_fails() {
    let fx = Fixture::new();
    let job = fx.claim("test_job_queue");
    let id = job.id;

    supervise(
        fx.store.clone(),
        fx.logs_tx.clone(),
        fx.cancels.clone(),
        job,
        sh("true"),
        super::DEFAULT_GRACE,
    )
    .await
    .unwrap();

    let job = fx.finish().await.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::Internal);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dismissal_terminates_child_within_grace() {
    let fx = Fixture::new();
    let job = fx.claim("run_incremental_normal_depth");
    let id = job.id;

    let task = tokio::spawn(supervise(
        fx.store.clone(),
        fx.logs_tx.clone(),
        fx.cancels.clone(),
        job,
        sh("sleep 30"),
        std::time::Duration::from_secs(2),
    ));

    // Wait for the child to be spawned and recorded.
    let started = std::time::Instant::now();
    loop {
        if fx.store.get(id).unwrap().child_pid.is_some() {
            break;
        }
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    // Dismiss through the store, then signal the supervisor, exactly as the
    // HTTP surface does. The store transition is immediate.
    fx.store.dismiss(id).unwrap();
    assert!(fx.cancels.cancel(id));

    tokio::time::timeout(std::time::Duration::from_secs(5), task)
        .await
        .expect("child exits within the grace window")
        .unwrap()
        .unwrap();

    let job = fx.finish().await.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Dismissed);
    assert_eq!(job.exit_code, Some(-1));
    assert_eq!(job.error.unwrap().kind, ErrorKind::Dismissed);
    assert!(job.end_time.is_some());
}

#[test]
fn test_harvest_rules() {
    // Exit 0 with an object on the last stdout line is the result.
    let ok = harvest(0, Some("{\"a\":1}".to_string()), None).unwrap();
    assert_eq!(ok, serde_json::json!({"a": 1}));

    // Exit 0 with a non-object final line is not a result document.
    let err = harvest(0, Some("[1,2]".to_string()), None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);

    // Non-zero exit parses the final stderr line as the error document.
    let err = harvest(
        2,
        None,
        Some("{\"kind\":\"ReachBusy\",\"detail\":\"locked\"}".to_string()),
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ReachBusy);

    // Unparseable stderr synthesizes Internal with the tail as traceback.
    let err = harvest(2, None, Some("segfault".to_string())).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);
    assert!(err.traceback.is_some());
}
