use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of a task. The discriminants are what the store writes into the
/// status column, so existing values must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending = 1,
    ImagePull = 2,
    Creating = 3,
    Starting = 4,
    Running = 5,
    Suspended = 6,
    Exited = 7,
    Crashed = 8,
}

impl TaskStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(raw: i64) -> Option<Self> {
        let status = match raw {
            1 => TaskStatus::Pending,
            2 => TaskStatus::ImagePull,
            3 => TaskStatus::Creating,
            4 => TaskStatus::Starting,
            5 => TaskStatus::Running,
            6 => TaskStatus::Suspended,
            7 => TaskStatus::Exited,
            8 => TaskStatus::Crashed,
            _ => return None,
        };
        Some(status)
    }
}

/// An image string decomposed into its parts. Built once by `ImageRef::parse`
/// and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub full_name: String,
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

/// What a caller asks the worker to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDefinition {
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub deployment_name: String,
    #[serde(default)]
    pub stack_name: String,
    pub image: String,
    /// Fractional cores. `None` or `0.0` means the worker default.
    #[serde(default)]
    pub cpu: Option<f64>,
    /// Bytes. `None` or `0` means the worker default.
    #[serde(default)]
    pub memory: Option<u64>,
    /// Container ports to publish on the host and route through the proxy.
    #[serde(default)]
    pub exposed_ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub app_name: String,
    pub deployment_name: String,
    pub stack_name: String,
    pub image: ImageRef,
    pub cpu: f64,
    pub memory: u64,
    /// Informational once stored; the store's status column wins.
    pub status: TaskStatus,
    pub container_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// host port -> container port
    #[serde(default)]
    pub host_port_bindings: BTreeMap<u16, u16>,
}

impl Task {
    pub fn new(def: &TaskDefinition) -> TaskResult<Self> {
        let image = ImageRef::parse(&def.image)?;

        Ok(Task {
            id: Uuid::now_v7(),
            app_name: def.app_name.clone(),
            deployment_name: def.deployment_name.clone(),
            stack_name: def.stack_name.clone(),
            image,
            cpu: def.cpu.unwrap_or_default(),
            memory: def.memory.unwrap_or_default(),
            status: TaskStatus::Pending,
            container_id: None,
            started_at: None,
            host_port_bindings: BTreeMap::new(),
        })
    }

    pub fn qualified_name(&self) -> String {
        format!(
            "{}--{}--{}",
            self.app_name, self.deployment_name, self.stack_name
        )
    }

    pub fn domain(&self) -> String {
        format!(
            "{}.{}.{}",
            self.app_name, self.deployment_name, self.stack_name
        )
    }

    pub fn network_name(&self) -> String {
        format!("{}-{}-net", self.deployment_name, self.stack_name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub total_tasks: usize,
    pub allocated_cpu: f64,
    pub allocated_mem: u64,
}

impl AggregateMetrics {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        tasks
            .into_iter()
            .fold(AggregateMetrics::default(), |mut agg, task| {
                agg.total_tasks += 1;
                agg.allocated_cpu += task.cpu;
                agg.allocated_mem += task.memory;
                agg
            })
    }
}

/// Everything the runtime needs to create a task's container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    /// host port -> container port
    pub port_bindings: BTreeMap<u16, u16>,
    pub network_mode: String,
    pub nano_cpus: i64,
    pub memory: i64,
}

/// A container as reported by the runtime's list call.
#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub id: String,
    pub labels: HashMap<String, String>,
    /// Human readable status, e.g. `Created`, `Up 3 minutes`, `Exited (0) 2 seconds ago`.
    pub status: String,
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(Uuid),

    #[error("empty task record: {0}")]
    EmptyRecord(Uuid),

    #[error("corrupt task record {id}: {reason}")]
    CorruptRecord { id: Uuid, reason: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("container runtime error: {0}")]
    Runtime(String),
}

impl From<bollard::errors::Error> for TaskError {
    fn from(err: bollard::errors::Error) -> Self {
        TaskError::Runtime(err.to_string())
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> TaskDefinition {
        TaskDefinition {
            app_name: "web".into(),
            deployment_name: "blue".into(),
            stack_name: "shop".into(),
            image: "library/ubuntu:latest".into(),
            cpu: Some(0.5),
            memory: Some(64 << 20),
            ..Default::default()
        }
    }

    #[test]
    fn new_task_starts_pending_without_container() {
        let task = Task::new(&definition()).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.container_id.is_none());
        assert!(task.started_at.is_none());
        assert_eq!(task.image.repository, "library/ubuntu");
    }

    #[test]
    fn names_are_derived_from_grouping() {
        let task = Task::new(&definition()).unwrap();
        assert_eq!(task.qualified_name(), "web--blue--shop");
        assert_eq!(task.domain(), "web.blue.shop");
        assert_eq!(task.network_name(), "blue-shop-net");
    }

    #[test]
    fn ids_follow_creation_order() {
        let first = Task::new(&definition()).unwrap();
        let second = Task::new(&definition()).unwrap();
        assert!(first.id.as_bytes() < second.id.as_bytes());
    }

    #[test]
    fn bad_image_is_rejected() {
        let mut def = definition();
        def.image = "".into();
        assert!(matches!(Task::new(&def), Err(TaskError::Validation(_))));
    }

    #[test]
    fn status_column_values_round_trip() {
        for raw in 1..=8 {
            let status = TaskStatus::from_i64(raw).unwrap();
            assert_eq!(status.as_i64(), raw);
        }
        assert!(TaskStatus::from_i64(0).is_none());
        assert!(TaskStatus::from_i64(9).is_none());
    }
}
