use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use super::config::WorkerConfig;
use super::types::{Orchestrator, TaskFilter, TaskServer, WorkerError, WorkerResult};
use crate::lib::tasks::types::{TaskDefinition, TaskError};

type ServerState = AxumState<Arc<TaskServer>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Stop,
    Wake,
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: TaskAction,
}

#[derive(Debug, Default, Deserialize)]
pub struct DestroyParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<WorkerError> for ApiError {
    fn from(err: WorkerError) -> Self {
        let status = match &err {
            WorkerError::InsufficientResources { .. } => StatusCode::CONFLICT,
            WorkerError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            WorkerError::Task(TaskError::NotFound(_)) => StatusCode::NOT_FOUND,
            WorkerError::Task(TaskError::Validation(_)) => StatusCode::BAD_REQUEST,
            WorkerError::Task(TaskError::Runtime(_)) => StatusCode::BAD_GATEWAY,
            WorkerError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            WorkerError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|err| ApiError::bad_request(format!("invalid task id {}: {}", raw, err)))
}

impl TaskServer {
    pub fn new(
        worker: Arc<dyn Orchestrator>,
        config: &WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker,
            api_version: config.api_version.clone(),
            worker_id: config.worker_id.clone(),
            address: config.api_address.clone(),
            port: config.api_port,
            shutdown,
        }
    }

    /// Runs a lifecycle operation on its own task so it always reaches a
    /// consistent end. Dropping the request (client went away) cancels the
    /// operation's token instead of abandoning it halfway.
    async fn run_detached<T, F, Fut>(&self, op: F) -> Result<T, ApiError>
    where
        F: FnOnce(Arc<dyn Orchestrator>, CancellationToken) -> Fut,
        Fut: Future<Output = WorkerResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = self.shutdown.child_token();
        let guard = cancel.clone().drop_guard();

        let res = tokio::spawn(op(self.worker.clone(), cancel)).await;
        guard.disarm();

        match res {
            Ok(res) => res.map_err(ApiError::from),
            Err(err) => Err(ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("operation aborted: {}", err),
            }),
        }
    }

    async fn up(AxumState(server): ServerState) -> impl IntoResponse {
        Json(json!({
            "api_version": server.api_version,
            "worker_id": server.worker_id,
        }))
    }

    async fn capacity(AxumState(server): ServerState) -> impl IntoResponse {
        Json(server.worker.system_metrics())
    }

    async fn list_tasks(
        AxumState(server): ServerState,
        Query(filter): Query<TaskFilter>,
    ) -> Result<impl IntoResponse, ApiError> {
        let tasks = server.worker.list_tasks(&filter).await?;
        Ok(Json(tasks))
    }

    async fn get_task(
        AxumState(server): ServerState,
        Path(id): Path<String>,
    ) -> Result<impl IntoResponse, ApiError> {
        let task = server.worker.inspect_task(parse_id(&id)?).await?;
        Ok(Json(task))
    }

    async fn start_task(
        AxumState(server): ServerState,
        Json(def): Json<TaskDefinition>,
    ) -> Result<impl IntoResponse, ApiError> {
        let task = server
            .run_detached(move |worker, cancel| async move {
                worker.start_task(def, &cancel).await
            })
            .await?;
        Ok((StatusCode::CREATED, Json(task)))
    }

    async fn update_task(
        AxumState(server): ServerState,
        Path(id): Path<String>,
        Json(req): Json<ActionRequest>,
    ) -> Result<impl IntoResponse, ApiError> {
        let id = parse_id(&id)?;
        let task = server
            .run_detached(move |worker, cancel| async move {
                match req.action {
                    TaskAction::Stop => worker.stop_task(id, &cancel).await,
                    TaskAction::Wake => worker.wake_task(id, &cancel).await,
                }
            })
            .await?;
        Ok(Json(task))
    }

    async fn destroy_task(
        AxumState(server): ServerState,
        Path(id): Path<String>,
        Query(params): Query<DestroyParams>,
    ) -> Result<impl IntoResponse, ApiError> {
        let id = parse_id(&id)?;
        server
            .run_detached(move |worker, cancel| async move {
                worker.destroy_task(id, params.force, &cancel).await
            })
            .await?;
        Ok(StatusCode::NO_CONTENT)
    }

    async fn list_volumes(AxumState(server): ServerState) -> Result<impl IntoResponse, ApiError> {
        let volumes = server
            .run_detached(|worker, cancel| async move { worker.list_volumes(&cancel).await })
            .await?;
        Ok(Json(volumes))
    }

    pub fn router(self: Arc<Self>) -> Router {
        let v1 = Router::new()
            .route("/up", get(TaskServer::up))
            .route("/capacity", get(TaskServer::capacity))
            .route("/volumes", get(TaskServer::list_volumes))
            .route(
                "/tasks",
                get(TaskServer::list_tasks).post(TaskServer::start_task),
            )
            .route(
                "/tasks/{id}",
                get(TaskServer::get_task)
                    .put(TaskServer::update_task)
                    .delete(TaskServer::destroy_task),
            );

        Router::new().nest("/v1", v1).with_state(self)
    }

    /// Serves until the shutdown token fires.
    pub async fn start_server(self) -> std::io::Result<()> {
        let address = format!("{}:{}", self.address, self.port);
        let shutdown = self.shutdown.clone();
        let app = Arc::new(self).router();

        let listener = TcpListener::bind(&address).await?;
        info!(%address, "worker api listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        info!("worker api stopped");
        Ok(())
    }
}
