//! End-to-end exercises of the HTTP surface wired to a live worker pool.
//! Worker children are shell scripts standing in for the `invoke`
//! subcommand, so the full spawn/capture/harvest/dismiss path runs.

use crate::api::build_router;
use crate::pool::{CommandFactory, PoolConfig, WorkerPool};
use crate::App;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use job_store::JobStore;
use models::JobStatus;
use std::sync::Arc;
use tower::ServiceExt;

struct Service {
    app: Arc<App>,
    router: axum::Router,
    _pool: Option<WorkerPool>,
    _logs_tx: supervisor::logs::Tx,
}

/// Children echo an empty result document, except `run_*` processes which
/// sleep so dismissal can be exercised.
fn sh_factory() -> CommandFactory {
    Arc::new(|job: &models::Job| {
        let mut cmd = supervisor::process::Command::new("/bin/sh");
        let script = if job.process.starts_with("run_") {
            "sleep 30".to_string()
        } else {
            "echo '{}'".to_string()
        };
        cmd.arg("-c").arg(script);
        cmd
    })
}

fn service(workers: usize) -> Service {
    let store = JobStore::in_memory().unwrap();
    let app = App::new(store.clone(), registry::Registry::default());
    let (logs_tx, logs_rx) = tokio::sync::mpsc::channel(supervisor::logs::CHANNEL_DEPTH);
    tokio::spawn(supervisor::logs::serve_sink(store, logs_rx));

    let pool = (workers > 0).then(|| {
        WorkerPool::start(
            app.clone(),
            logs_tx.clone(),
            sh_factory(),
            PoolConfig {
                workers,
                poll_interval: std::time::Duration::from_millis(50),
                grace: std::time::Duration::from_secs(2),
            },
        )
    });

    Service {
        router: build_router(app.clone()),
        app,
        _pool: pool,
        _logs_tx: logs_tx,
    }
}

async fn request(
    service: &Service,
    method: &str,
    path: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, String) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = service.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

async fn request_json(
    service: &Service,
    method: &str,
    path: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let (status, text) = request(service, method, path, body).await;
    let value = serde_json::from_str(&text)
        .unwrap_or_else(|_| serde_json::Value::String(text.clone()));
    (status, value)
}

async fn wait_for<F>(service: &Service, id: models::JobId, what: &str, predicate: F) -> models::Job
where
    F: Fn(&models::Job) -> bool,
{
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let job = service.app.store.get(id).unwrap();
        if predicate(&job) {
            return job;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {what}; job is {:?}",
            job.status
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping() {
    let service = service(0);
    let (status, body) = request_json(&service, "GET", "/ping", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"status": "healthy"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_process_listing() {
    let service = service(0);
    let (status, body) = request_json(&service, "GET", "/processes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processes"].as_array().unwrap().len(), 11);

    let (status, body) =
        request_json(&service, "GET", "/processes/conflate_model", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "conflate_model");

    let (status, _) = request_json(&service, "GET", "/processes/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execution_request_validation() {
    let service = service(0);

    let (status, _) = request_json(
        &service,
        "POST",
        "/processes/not_registered/execution",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request_json(
        &service,
        "POST",
        "/processes/test_job_queue/execution",
        Some(serde_json::json!({"bogus": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request_json(
        &service,
        "POST",
        "/processes/ras_to_gpkg/execution",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// Scenario: a health-check job flows accepted -> running -> successful and
// serves an empty result document.
#[tokio::test(flavor = "multi_thread")]
async fn test_health_check_round_trip() {
    let service = service(2);

    let (status, body) = request_json(
        &service,
        "POST",
        "/processes/test_job_queue/execution",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id: models::JobId = body["jobID"].as_str().unwrap().parse().unwrap();

    let job = wait_for(&service, id, "success", |j| {
        j.status == JobStatus::Successful
    })
    .await;
    assert_eq!(job.exit_code, Some(0));
    assert!(job.child_pid.is_some(), "running jobs record a child pid");

    let (status, body) =
        request_json(&service, "GET", &format!("/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "successful");
    assert_eq!(body["processID"], "test_job_queue");
    assert!(body["created"].is_string());
    assert!(body["finished"].is_string());

    let (status, results) =
        request_json(&service, "GET", &format!("/jobs/{id}/results"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results, serde_json::json!({}));

    let (status, metadata) =
        request_json(&service, "GET", &format!("/jobs/{id}/metadata"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metadata["exitCode"], 0);
    assert!(metadata["childPid"].is_number());

    let (status, logs) = request(&service, "GET", &format!("/jobs/{id}/logs"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs, "{}\n");
}

// Boundary: with zero workers, accepted jobs wait.
#[tokio::test(flavor = "multi_thread")]
async fn test_jobs_wait_without_workers() {
    let service = service(0);
    let (status, body) = request_json(
        &service,
        "POST",
        "/processes/test_job_queue/execution",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id: models::JobId = body["jobID"].as_str().unwrap().parse().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let (_, body) = request_json(&service, "GET", &format!("/jobs/{id}"), None).await;
    assert_eq!(body["status"], "accepted");
}

// Boundary: dismissing an accepted job transitions without a child.
#[tokio::test(flavor = "multi_thread")]
async fn test_dismiss_accepted_job() {
    let service = service(0);
    let (_, body) = request_json(
        &service,
        "POST",
        "/processes/test_job_queue/execution",
        Some(serde_json::json!({})),
    )
    .await;
    let id: models::JobId = body["jobID"].as_str().unwrap().parse().unwrap();

    let (status, body) =
        request_json(&service, "DELETE", &format!("/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "dismissed");

    let job = service.app.store.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Dismissed);
    assert_eq!(job.child_pid, None);
}

// Scenario: dismissing a running job returns immediately; the child is
// terminated within the grace window and the terminal record survives.
#[tokio::test(flavor = "multi_thread")]
async fn test_dismiss_running_job() {
    let service = service(1);
    let (_, body) = request_json(
        &service,
        "POST",
        "/processes/run_incremental_normal_depth/execution",
        Some(serde_json::json!({"submodel_directory": "/data/submodels/2823932"})),
    )
    .await;
    let id: models::JobId = body["jobID"].as_str().unwrap().parse().unwrap();

    wait_for(&service, id, "running child", |j| j.child_pid.is_some()).await;

    let started = std::time::Instant::now();
    let (status, _) = request_json(&service, "DELETE", &format!("/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        started.elapsed() < std::time::Duration::from_millis(500),
        "dismissal responds immediately"
    );

    let job = wait_for(&service, id, "dismissal to finalize", |j| {
        j.exit_code == Some(-1)
    })
    .await;
    assert_eq!(job.status, JobStatus::Dismissed);
    assert!(job.end_time.is_some());

    // The terminal record remains readable.
    let (status, body) =
        request_json(&service, "GET", &format!("/jobs/{id}?tb=true"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "dismissed");
    assert_eq!(body["exitCode"], -1);
    assert!(body["traceback"].is_string());

    // Results of a dismissed job conflict.
    let (status, _) =
        request_json(&service, "GET", &format!("/jobs/{id}/results"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Dismissing again is a no-op 200.
    let (status, _) = request_json(&service, "DELETE", &format!("/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_results_conflict_until_terminal() {
    let service = service(0);
    let (_, body) = request_json(
        &service,
        "POST",
        "/processes/test_job_queue/execution",
        Some(serde_json::json!({})),
    )
    .await;
    let id = body["jobID"].as_str().unwrap().to_string();

    let (status, _) =
        request_json(&service, "GET", &format!("/jobs/{id}/results"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_listing_and_filters() {
    let service = service(0);
    for _ in 0..2 {
        request_json(
            &service,
            "POST",
            "/processes/test_job_queue/execution",
            Some(serde_json::json!({})),
        )
        .await;
    }
    request_json(
        &service,
        "POST",
        "/processes/ras_to_gpkg/execution",
        Some(serde_json::json!({"source_model_directory": "/data/Baxter"})),
    )
    .await;

    let (status, body) = request_json(&service, "GET", "/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 3);

    let (_, body) =
        request_json(&service, "GET", "/jobs?process=test_job_queue", None).await;
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (_, body) = request_json(&service, "GET", "/jobs?status=accepted", None).await;
    assert_eq!(body.as_array().unwrap().len(), 3);

    let (status, _) = request_json(&service, "GET", "/jobs?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_job_is_404() {
    let service = service(0);
    let id = models::JobId::generate();
    for path in [
        format!("/jobs/{id}"),
        format!("/jobs/{id}/results"),
        format!("/jobs/{id}/metadata"),
        format!("/jobs/{id}/logs"),
        "/jobs/not-even-a-uuid".to_string(),
    ] {
        let (status, _) = request_json(&service, "GET", &path, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
    }
}
