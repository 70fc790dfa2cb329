//! The OGC-shaped HTTP surface. Handlers do no business work: every route
//! is a thin façade over the job store and the process registry, and all
//! store calls run on the blocking pool.

use crate::{blocking, App};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use job_store::{Dismissal, ListFilter, StoreError};
use models::{Job, JobId, JobStatus};
use std::sync::Arc;

/// An error response: an HTTP status plus a wrapped error rendered into
/// the JSON body.
#[derive(Debug, thiserror::Error)]
#[error("status: {status}, error: {error}")]
pub struct ApiError {
    pub status: StatusCode,
    #[source]
    pub error: anyhow::Error,
}

impl ApiError {
    pub fn new(status: StatusCode, error: anyhow::Error) -> ApiError {
        ApiError { status, error }
    }

    fn not_found(detail: impl std::fmt::Display) -> ApiError {
        ApiError::new(StatusCode::NOT_FOUND, anyhow::anyhow!("{detail}"))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match &error {
            StoreError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, error.into()),
            StoreError::Terminal(..) | StoreError::WrongStatus { .. } => {
                ApiError::new(StatusCode::CONFLICT, error.into())
            }
            _ => {
                tracing::error!(?error, "API responding with store error");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, error.into())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "status": self.status.as_u16(),
            "error": format!("{:#}", self.error),
        });
        (self.status, Json(body)).into_response()
    }
}

/// `GET /jobs/{id}` response shape; also the element shape of `GET /jobs`.
#[derive(Debug, serde::Serialize)]
pub struct JobResponse {
    #[serde(rename = "jobID")]
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(rename = "processID")]
    pub process_id: String,
    pub created: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<chrono::DateTime<chrono::Utc>>,
    pub updated: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl JobResponse {
    fn of(job: &Job, with_traceback: bool) -> JobResponse {
        JobResponse {
            job_id: job.id,
            status: job.status,
            process_id: job.process.clone(),
            created: job.submit_time,
            started: job.start_time,
            finished: job.end_time,
            updated: job.updated(),
            exit_code: job.exit_code,
            traceback: if with_traceback {
                job.error.as_ref().map(|e| {
                    e.traceback
                        .clone()
                        .unwrap_or_else(|| format!("{}: {}", e.kind, e.detail))
                })
            } else {
                None
            },
        }
    }
}

pub fn build_router(app: Arc<App>) -> axum::Router {
    axum::Router::new()
        .route("/ping", get(ping))
        .route("/processes", get(list_processes))
        .route("/processes/:name", get(get_process))
        .route("/processes/:name/execution", post(execute))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job).delete(dismiss_job))
        .route("/jobs/:id/results", get(job_results))
        .route("/jobs/:id/metadata", get(job_metadata))
        .route("/jobs/:id/logs", get(job_logs))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(app)
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

fn process_json(spec: &registry::ProcessSpec) -> serde_json::Value {
    serde_json::json!({
        "id": spec.name,
        "title": spec.title,
        "inputs": spec
            .inputs
            .iter()
            .map(|f| serde_json::json!({"name": f.name, "required": f.required}))
            .collect::<Vec<_>>(),
    })
}

async fn list_processes(State(app): State<Arc<App>>) -> Json<serde_json::Value> {
    let processes: Vec<_> = app.registry.all().map(process_json).collect();
    Json(serde_json::json!({ "processes": processes }))
}

async fn get_process(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let spec = app
        .registry
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("process {name:?} is not registered")))?;
    Ok(Json(process_json(spec)))
}

async fn execute(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Json(input): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    app.registry.validate(&name, &input).map_err(|err| match err {
        registry::ValidateError::UnknownProcess(_) => {
            ApiError::new(StatusCode::NOT_FOUND, err.into())
        }
        registry::ValidateError::InvalidInput(_) => {
            ApiError::new(StatusCode::BAD_REQUEST, err.into())
        }
    })?;

    let job = blocking(&app.store, move |s| s.enqueue(&name, &input)).await??;
    app.wake.notify_waiters();

    tracing::info!(job_id = %job.id, process = %job.process, "accepted execution request");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"jobID": job.id})),
    ))
}

#[derive(Debug, serde::Deserialize)]
struct ListQuery {
    process: Option<String>,
    status: Option<String>,
}

async fn list_jobs(
    State(app): State<Arc<App>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, anyhow::anyhow!(err)))?;
    let filter = ListFilter {
        process: query.process,
        status,
    };
    let jobs = blocking(&app.store, move |s| s.list(&filter)).await??;
    Ok(Json(jobs.iter().map(|j| JobResponse::of(j, false)).collect()))
}

#[derive(Debug, serde::Deserialize)]
struct TracebackQuery {
    #[serde(default)]
    tb: bool,
}

fn parse_job_id(id: &str) -> Result<JobId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::not_found(format!("job {id:?} does not exist")))
}

async fn get_job(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    Query(query): Query<TracebackQuery>,
) -> Result<Json<JobResponse>, ApiError> {
    let id = parse_job_id(&id)?;
    let job = blocking(&app.store, move |s| s.get(id)).await??;
    Ok(Json(JobResponse::of(&job, query.tb)))
}

async fn job_results(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_job_id(&id)?;
    let job = blocking(&app.store, move |s| s.get(id)).await??;
    match (job.status, job.result) {
        (JobStatus::Successful, Some(result)) => Ok(Json(result)),
        (status, _) => Err(ApiError::new(
            StatusCode::CONFLICT,
            anyhow::anyhow!("job {id} is {status}; results exist only for successful jobs"),
        )),
    }
}

async fn job_metadata(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_job_id(&id)?;
    let job = blocking(&app.store, move |s| s.get(id)).await??;
    Ok(Json(serde_json::json!({
        "jobID": job.id,
        "processID": job.process,
        "submitted": job.submit_time,
        "started": job.start_time,
        "finished": job.end_time,
        "exitCode": job.exit_code,
        "childPid": job.child_pid,
    })))
}

async fn job_logs(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<String, ApiError> {
    let id = parse_job_id(&id)?;
    Ok(blocking(&app.store, move |s| s.logs(id)).await??)
}

async fn dismiss_job(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_job_id(&id)?;
    let dismissal = blocking(&app.store, move |s| s.dismiss(id)).await?;
    match dismissal {
        Ok(Dismissal::FromRunning { .. }) => {
            // Signal the supervisor; the response does not wait on the
            // child's termination.
            app.cancels.cancel(id);
        }
        Ok(Dismissal::FromAccepted) => {}
        // Dismissing an already-terminal job is a no-op, not an error.
        Err(StoreError::Terminal(..)) => {}
        Err(err) => return Err(err.into()),
    }
    tracing::info!(job_id = %id, "dismissed");
    Ok(Json(serde_json::json!({
        "jobID": id,
        "status": JobStatus::Dismissed,
    })))
}
