use std::{collections::HashMap, future::Future, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sysinfo::System;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

use super::types::{ApiError, SystemStats, TaskServer, Worker};
use crate::lib::{
    store::types::TaskQuery,
    tasks::{
        state::valid_state_transition,
        types::{State, Task},
    },
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TaskRequest {
    pub name: String,
    pub image: String,
    pub port_mapping: HashMap<String, String>,
    pub exposed_ports: Vec<u16>,
    pub resources: Resources,
    pub restart_policy: String,
    pub env: Vec<String>,
}

/// `memory` and `disk` in MiB.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub memory: i64,
    pub cpus: f64,
    pub disk: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub name: String,
    pub image: String,
    pub state: State,
}

impl From<&Task> for TaskResponse {
    fn from(task: &Task) -> Self {
        TaskResponse {
            id: task.id,
            name: task.name.clone(),
            image: task.image.clone(),
            state: task.state,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub state: Option<String>,
}

struct ApiState {
    worker: Arc<Worker>,
    host: Mutex<System>,
}

type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(e) => {
                error!(error = %e, "store failure while serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

fn ensure_open(worker: &Worker) -> ApiResult<()> {
    if worker.is_closed() {
        return Err(ApiError::Unavailable("worker is shutting down".into()));
    }
    Ok(())
}

fn parse_id(id: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| ApiError::BadRequest("given uuid of task is improper".into()))
}

impl TaskServer {
    pub fn new(worker: Arc<Worker>, address: &str, port: u16) -> Self {
        Self {
            worker,
            address: address.to_string(),
            port,
        }
    }

    async fn start_task(
        AxumState(state): AxumState<Arc<ApiState>>,
        Json(req): Json<TaskRequest>,
    ) -> ApiResult<impl IntoResponse> {
        ensure_open(&state.worker)?;
        if req.image.trim().is_empty() {
            return Err(ApiError::BadRequest("image field is mandatory".into()));
        }
        if req.name.trim().is_empty() {
            return Err(ApiError::BadRequest("name field is mandatory".into()));
        }

        let task = Task {
            state: State::Scheduled,
            memory: req.resources.memory,
            disk: req.resources.disk,
            cpus: req.resources.cpus,
            exposed_ports: req.exposed_ports,
            port_bindings: req.port_mapping,
            restart_policy: req.restart_policy,
            env: req.env,
            ..Task::new(&req.name, &req.image)
        };
        task.check_resources().map_err(ApiError::BadRequest)?;

        let store = state.worker.store();
        for active in [State::Scheduled, State::Running] {
            if !store
                .query(&TaskQuery::by_name_and_state(&req.name, active))?
                .is_empty()
            {
                return Err(ApiError::Conflict(format!(
                    "task with name {} is already {}",
                    req.name, active
                )));
            }
        }

        store.put(&task)?;
        state.worker.add_task(task.clone());
        info!(task_id = %task.id, name = %task.name, "task submitted to queue");

        Ok((StatusCode::ACCEPTED, Json(TaskResponse::from(&task))))
    }

    async fn stop_task(
        AxumState(state): AxumState<Arc<ApiState>>,
        Path(id): Path<String>,
    ) -> ApiResult<impl IntoResponse> {
        ensure_open(&state.worker)?;
        let id = parse_id(&id)?;
        let task = state
            .worker
            .store()
            .get(&id)?
            .ok_or_else(|| ApiError::NotFound(format!("no task found with id {}", id)))?;

        if !valid_state_transition(&task.state, &State::Completed) {
            return Err(ApiError::Conflict(format!(
                "task {} is {}, only running tasks can be stopped",
                id, task.state
            )));
        }

        state.worker.add_task(Task::stop_request(id));
        info!(task_id = %id, "task queued to stop");
        Ok((StatusCode::ACCEPTED, Json(TaskResponse::from(&task))))
    }

    async fn get_tasks(
        AxumState(state): AxumState<Arc<ApiState>>,
        Query(params): Query<ListParams>,
    ) -> ApiResult<Json<Vec<Task>>> {
        let wanted = match params.state.as_deref() {
            None | Some("") => State::Running,
            Some(name) => name
                .parse()
                .map_err(|_| ApiError::BadRequest("Invalid State".into()))?,
        };

        Ok(Json(state.worker.store().query(&TaskQuery::by_state(wanted))?))
    }

    async fn get_task(
        AxumState(state): AxumState<Arc<ApiState>>,
        Path(id): Path<String>,
    ) -> ApiResult<Json<Task>> {
        let id = parse_id(&id)?;
        state
            .worker
            .store()
            .get(&id)?
            .map(Json)
            .ok_or_else(|| ApiError::NotFound(format!("no task found with id {}", id)))
    }

    async fn get_stats(AxumState(state): AxumState<Arc<ApiState>>) -> Json<SystemStats> {
        let mut host = state.host.lock();
        host.refresh_all();
        Json(SystemStats::sample(
            &host,
            state.worker.processed_count(),
            state.worker.queue_len(),
        ))
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(ApiState {
            worker: self.worker.clone(),
            host: Mutex::new(System::new_all()),
        });

        Router::new()
            .route("/tasks", get(TaskServer::get_tasks).post(TaskServer::start_task))
            .route(
                "/tasks/{id}",
                get(TaskServer::get_task).delete(TaskServer::stop_task),
            )
            .route("/stats", get(TaskServer::get_stats))
            .with_state(state)
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind((self.address.as_str(), self.port)).await?;
        info!("listening on {}:{}", self.address, self.port);
        Ok(listener)
    }

    /// Serves until `shutdown` resolves, then lets in-flight requests finish.
    pub async fn start_server(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}
