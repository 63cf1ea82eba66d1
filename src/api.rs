use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Config, DEFAULT_QUEUE};
use crate::handler::{encode_raw, HandlerRegistry};
use crate::models::{Job, Status};
use crate::store::JobStore;

type ApiError = (StatusCode, String);

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    registry: Arc<HandlerRegistry>,
}

impl AppState {
    /// State for a server whose workers run the stock handlers.
    pub fn new(config: Config) -> Self {
        AppState::with_registry(config, HandlerRegistry::with_builtins())
    }

    pub fn with_registry(config: Config, registry: HandlerRegistry) -> Self {
        AppState {
            config: Arc::new(config),
            registry: Arc::new(registry),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(create_job_handler))
        .route("/jobs/bulk", post(create_jobs_handler))
        .route("/jobs/status", get(status_handler))
        .route("/jobs/:id", get(get_job_handler))
        .route("/locks/release", post(release_locks_handler))
        .with_state(state)
}

fn open_store(state: &AppState) -> Result<JobStore, ApiError> {
    JobStore::connect(&state.config).map_err(|e| {
        log::error!("Failed to open job store. {}", e);

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to open job store.".into(),
        )
    })
}

fn queue_name(queue: Option<String>) -> Result<String, ApiError> {
    let queue = queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string());
    let queue = queue.trim();

    if queue.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "queue cannot be empty.".into()));
    }

    Ok(queue.to_string())
}

#[derive(Serialize)]
pub struct JobDto {
    id: String,
    handler: Value,
    queue: String,
    attempts: i32,
    run_at: Option<NaiveDateTime>,
    locked_at: Option<NaiveDateTime>,
    locked_by: Option<String>,
    failed_at: Option<NaiveDateTime>,
    error: Option<String>,
    created_at: NaiveDateTime,
}

fn transform_job(job: Job) -> JobDto {
    // Rows can hold handlers that are not JSON; show those verbatim.
    let handler = serde_json::from_str(&job.handler).unwrap_or(Value::String(job.handler));

    JobDto {
        id: job.id,
        handler,
        queue: job.queue,
        attempts: job.attempts,
        run_at: job.run_at,
        locked_at: job.locked_at,
        locked_by: job.locked_by,
        failed_at: job.failed_at,
        error: job.error,
        created_at: job.created_at,
    }
}

#[derive(Deserialize)]
pub struct HandlerInput {
    kind: String,
    #[serde(default)]
    payload: Value,
}

fn encode_input(registry: &HandlerRegistry, input: HandlerInput) -> Result<String, ApiError> {
    let kind = input.kind.trim();

    if kind.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "kind cannot be empty.".into()));
    }

    if !registry.contains(kind) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "Unknown handler kind {:?}, expected one of: {}.",
                kind,
                registry.kinds().join(", ")
            ),
        ));
    }

    encode_raw(kind, input.payload).map_err(|e| {
        log::error!("Failed to serialize {} handler. {}", kind, e);

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to serialize handler.".into(),
        )
    })
}

#[derive(Deserialize)]
pub struct NewJobInput {
    #[serde(flatten)]
    handler: HandlerInput,
    queue: Option<String>,
    run_at: Option<NaiveDateTime>,
}

#[derive(Serialize)]
pub struct CreateJobResponse {
    id: String,
}

pub async fn create_job_handler(
    State(state): State<AppState>,
    Json(new_job_input): Json<NewJobInput>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    let queue = queue_name(new_job_input.queue)?;
    let handler = encode_input(&state.registry, new_job_input.handler)?;

    let mut store = open_store(&state)?;

    match store.enqueue_raw(handler, &queue, new_job_input.run_at) {
        Ok(id) => {
            log::info!("Created job {} on queue {}.", id, queue);

            Ok((StatusCode::CREATED, Json(CreateJobResponse { id })))
        }
        Err(_) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to create job.".into(),
        )),
    }
}

#[derive(Deserialize)]
pub struct NewJobsInput {
    handlers: Vec<HandlerInput>,
    queue: Option<String>,
    run_at: Option<NaiveDateTime>,
}

#[derive(Serialize)]
pub struct CreateJobsResponse {
    ids: Vec<String>,
    requested: usize,
    inserted: usize,
}

pub async fn create_jobs_handler(
    State(state): State<AppState>,
    Json(new_jobs_input): Json<NewJobsInput>,
) -> Result<(StatusCode, Json<CreateJobsResponse>), ApiError> {
    let queue = queue_name(new_jobs_input.queue)?;

    if new_jobs_input.handlers.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "handlers cannot be empty.".into()));
    }

    let handlers = new_jobs_input
        .handlers
        .into_iter()
        .map(|input| encode_input(&state.registry, input))
        .collect::<Result<Vec<_>, _>>()?;

    let mut store = open_store(&state)?;

    match store.bulk_enqueue_raw(&handlers, &queue, new_jobs_input.run_at) {
        Ok(result) => {
            log::info!(
                "Created {} of {} jobs on queue {}.",
                result.inserted,
                result.requested,
                queue
            );

            Ok((
                StatusCode::CREATED,
                Json(CreateJobsResponse {
                    ids: result.ids,
                    requested: result.requested,
                    inserted: result.inserted,
                }),
            ))
        }
        Err(_) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to create jobs.".into(),
        )),
    }
}

#[derive(Deserialize)]
pub struct StatusQuery {
    queue: Option<String>,
}

pub async fn status_handler(
    State(state): State<AppState>,
    Query(status_query): Query<StatusQuery>,
) -> Result<Json<Status>, ApiError> {
    let queue = queue_name(status_query.queue)?;

    let mut store = open_store(&state)?;

    store.status(&queue).map(Json).map_err(|e| {
        log::error!("Failed to fetch status. {}", e);

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to fetch status.".into(),
        )
    })
}

pub async fn get_job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobDto>, ApiError> {
    let mut store = open_store(&state)?;

    match store.find(id.trim()) {
        Ok(Some(job)) => Ok(Json(transform_job(job))),
        Ok(None) => Err((StatusCode::NOT_FOUND, "Job does not exist.".into())),
        Err(e) => {
            log::error!("Failed to fetch job. {}", e);

            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch job.".into(),
            ))
        }
    }
}

#[derive(Deserialize)]
pub struct ReleaseLocksInput {
    worker: String,
}

#[derive(Serialize)]
pub struct ReleaseLocksResponse {
    released: usize,
}

/// Frees the rows a dead worker left locked.
pub async fn release_locks_handler(
    State(state): State<AppState>,
    Json(release_locks_input): Json<ReleaseLocksInput>,
) -> Result<Json<ReleaseLocksResponse>, ApiError> {
    let worker = release_locks_input.worker.trim();

    if worker.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "worker cannot be empty.".into()));
    }

    let mut store = open_store(&state)?;

    match store.release_locks_held_by(worker) {
        Ok(released) => Ok(Json(ReleaseLocksResponse { released })),
        Err(e) => {
            log::error!("Failed to release locks. {}", e);

            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to release locks.".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn state() -> (TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let config = Config::new(path.to_string_lossy().into_owned());

        JobStore::connect(&config).unwrap().create_table().unwrap();

        (dir, AppState::new(config))
    }

    fn echo_input(message: &str) -> HandlerInput {
        HandlerInput {
            kind: "echo".into(),
            payload: json!({ "message": message }),
        }
    }

    #[tokio::test]
    async fn creates_and_fetches_a_job() {
        let (_dir, state) = state();

        let (status, Json(created)) = create_job_handler(
            State(state.clone()),
            Json(NewJobInput {
                handler: echo_input("hi"),
                queue: None,
                run_at: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let Json(job) = get_job_handler(State(state.clone()), Path(created.id.clone()))
            .await
            .unwrap();
        assert_eq!(job.id, created.id);
        assert_eq!(job.queue, "default");
        assert_eq!(job.handler["kind"], "echo");
        assert_eq!(job.handler["payload"]["message"], "hi");
    }

    #[tokio::test]
    async fn rejects_blank_kind_and_queue() {
        let (_dir, state) = state();

        let err = create_job_handler(
            State(state.clone()),
            Json(NewJobInput {
                handler: HandlerInput {
                    kind: "  ".into(),
                    payload: Value::Null,
                },
                queue: None,
                run_at: None,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let err = create_job_handler(
            State(state),
            Json(NewJobInput {
                handler: echo_input("hi"),
                queue: Some(" ".into()),
                run_at: None,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bulk_create_and_status() {
        let (_dir, state) = state();

        let (_, Json(created)) = create_jobs_handler(
            State(state.clone()),
            Json(NewJobsInput {
                handlers: vec![echo_input("shopify"), echo_input("github")],
                queue: Some("mail".into()),
                run_at: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(created.requested, 2);
        assert_eq!(created.inserted, 2);
        assert_eq!(created.ids.len(), 2);

        let Json(status) = status_handler(
            State(state),
            Query(StatusQuery {
                queue: Some("mail".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            status,
            Status {
                outstanding: 2,
                locked: 0,
                failed: 0,
                total: 2
            }
        );
    }

    #[tokio::test]
    async fn bulk_create_needs_handlers() {
        let (_dir, state) = state();

        let err = create_jobs_handler(
            State(state),
            Json(NewJobsInput {
                handlers: vec![],
                queue: None,
                run_at: None,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let (_dir, state) = state();

        let err = get_job_handler(State(state), Path("nope".into()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn releases_a_dead_workers_locks() {
        let (_dir, state) = state();
        let mut store = JobStore::connect(&state.config).unwrap();
        let (ids, _) = store
            .insert(&["{}".to_string(), "{}".to_string()], "default", None)
            .unwrap();
        assert!(store.try_claim(&ids[0], "host::gone pid::1").unwrap());
        assert!(store.try_claim(&ids[1], "host::gone pid::1").unwrap());

        let Json(response) = release_locks_handler(
            State(state),
            Json(ReleaseLocksInput {
                worker: "host::gone pid::1".into(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.released, 2);
        assert_eq!(store.status("default").unwrap().locked, 0);
    }

    #[tokio::test]
    async fn rejects_unregistered_kinds() {
        let (_dir, state) = state();

        let err = create_job_handler(
            State(state.clone()),
            Json(NewJobInput {
                handler: HandlerInput {
                    kind: "launch_rockets".into(),
                    payload: Value::Null,
                },
                queue: None,
                run_at: None,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(err.1.contains("command, echo"));

        let mut store = JobStore::connect(&state.config).unwrap();
        assert_eq!(store.status("default").unwrap().total, 0);
    }
}
