use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::config::WorkerConfig;
use crate::lib::proxy::types::{ProxyError, Registrar};
use crate::lib::store::task_store::TaskStore;
use crate::lib::tasks::docker::ContainerRuntime;
use crate::lib::tasks::types::{Task, TaskDefinition, TaskError, TaskStatus};

/// Task lifecycle operations exposed to the API.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn list_tasks(&self, filter: &TaskFilter) -> WorkerResult<Vec<Task>>;

    async fn inspect_task(&self, id: Uuid) -> WorkerResult<Task>;

    async fn start_task(
        &self,
        def: TaskDefinition,
        cancel: &CancellationToken,
    ) -> WorkerResult<Task>;

    async fn stop_task(&self, id: Uuid, cancel: &CancellationToken) -> WorkerResult<Task>;

    async fn wake_task(&self, id: Uuid, cancel: &CancellationToken) -> WorkerResult<Task>;

    async fn destroy_task(
        &self,
        id: Uuid,
        force: bool,
        cancel: &CancellationToken,
    ) -> WorkerResult<()>;

    fn system_metrics(&self) -> SystemMetrics;

    async fn list_volumes(&self, cancel: &CancellationToken) -> WorkerResult<Vec<String>>;
}

/// The orchestrator of a single worker host.
pub struct Worker {
    pub config: WorkerConfig,
    pub store: Arc<TaskStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub registrar: Arc<dyn Registrar>,
    pub capacity: HostCapacity,
    /// Held across the whole start pipeline so admission never races a
    /// concurrent start.
    pub(super) schedule_lock: Mutex<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub total_cpu: usize,
    pub total_mem: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_cpu: usize,
    pub total_mem: u64,
    /// running and suspended tasks alike
    pub total_tasks: usize,
    pub allocated_cpu: f64,
    pub allocated_mem: u64,
    pub available_cpu: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub app_name: Option<String>,
    pub deployment_name: Option<String>,
    pub stack_name: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        let accepts = |want: &Option<String>, have: &str| {
            want.as_deref().is_none_or(|want| want.is_empty() || want == have)
        };

        accepts(&self.app_name, &task.app_name)
            && accepts(&self.deployment_name, &task.deployment_name)
            && accepts(&self.stack_name, &task.stack_name)
    }
}

pub struct TaskServer {
    pub worker: Arc<dyn Orchestrator>,
    pub api_version: String,
    pub worker_id: String,
    pub address: String,
    pub port: u16,
    /// Cancelled on shutdown; request handlers hand out child tokens.
    pub shutdown: CancellationToken,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("cannot schedule task: requested {requested} cpu but only {available} available")]
    InsufficientResources { requested: f64, available: f64 },

    #[error("invalid state transition for task {id}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("{0} was cancelled")]
    Cancelled(&'static str),

    #[error("{0} exceeded its deadline")]
    DeadlineExceeded(&'static str),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WorkerError::Task(TaskError::NotFound(_)))
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;
