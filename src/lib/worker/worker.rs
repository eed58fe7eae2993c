use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::config::WorkerConfig;
use super::provision::check_transition;
use super::stats::get_system_metrics;
use super::types::{
    HostCapacity, Orchestrator, SystemMetrics, TaskFilter, Worker, WorkerError, WorkerResult,
};
use crate::lib::proxy::types::Registrar;
use crate::lib::store::task_store::TaskStore;
use crate::lib::tasks::docker::ContainerRuntime;
use crate::lib::tasks::types::{Task, TaskDefinition, TaskError, TaskStatus};

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<TaskStore>,
        runtime: Arc<dyn ContainerRuntime>,
        registrar: Arc<dyn Registrar>,
        capacity: HostCapacity,
    ) -> Self {
        Worker {
            config,
            store,
            runtime,
            registrar,
            capacity,
            schedule_lock: Mutex::new(()),
        }
    }

    /// Fills unset resources from the worker defaults.
    fn with_defaults(&self, mut def: TaskDefinition) -> WorkerResult<TaskDefinition> {
        let cpu = match def.cpu {
            Some(cpu) if cpu != 0.0 => cpu,
            _ => self.config.default_task_cpu,
        };
        if !cpu.is_finite() || cpu < 0.0 {
            return Err(TaskError::Validation(format!("invalid cpu request: {}", cpu)).into());
        }

        let memory = match def.memory {
            Some(memory) if memory != 0 => memory,
            _ => self.config.default_task_mem,
        };

        def.cpu = Some(cpu);
        def.memory = Some(memory);
        Ok(def)
    }

    /// Rebuilds the proxy routes from the task store, e.g. after a restart
    /// left the registrar with an empty table.
    pub fn restore_routes(&self) -> WorkerResult<usize> {
        let mut restored = 0;
        for task in self.store.get_tasks()? {
            if task.host_port_bindings.is_empty() {
                continue;
            }
            self.publish_routes(&task)?;
            restored += 1;
        }

        info!(restored, "proxy routes restored");
        Ok(restored)
    }

    fn container_of(task: &Task) -> WorkerResult<String> {
        task.container_id.clone().ok_or_else(|| {
            TaskError::Validation(format!("task {} has no container", task.id)).into()
        })
    }
}

#[async_trait]
impl Orchestrator for Worker {
    async fn list_tasks(&self, filter: &TaskFilter) -> WorkerResult<Vec<Task>> {
        let tasks = self.store.get_tasks()?;
        Ok(tasks.into_iter().filter(|t| filter.matches(t)).collect())
    }

    async fn inspect_task(&self, id: Uuid) -> WorkerResult<Task> {
        Ok(self.store.get_task(id)?)
    }

    async fn start_task(
        &self,
        def: TaskDefinition,
        cancel: &CancellationToken,
    ) -> WorkerResult<Task> {
        let started = Instant::now();
        let def = self.with_defaults(def)?;
        let requested = def.cpu.unwrap_or(self.config.default_task_cpu);

        let _schedule_guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled("scheduling")),
            guard = self.schedule_lock.lock() => guard,
        };

        let available = get_system_metrics(&self.capacity, &self.store).available_cpu;
        if available < requested {
            warn!(
                app_name = %def.app_name,
                deployment_name = %def.deployment_name,
                stack_name = %def.stack_name,
                requested,
                available,
                "rejecting task, insufficient resources"
            );
            return Err(WorkerError::InsufficientResources {
                requested,
                available,
            });
        }

        let mut task = self.store.create_task(&def)?;
        info!(
            task_id = %task.id,
            qualified_name = %task.qualified_name(),
            image = %task.image.full_name,
            cpu = task.cpu,
            memory = task.memory,
            "task admitted"
        );

        if let Err(err) = self.provision(&mut task, &def.exposed_ports, cancel).await {
            warn!(task_id = %task.id, status = ?task.status, error = %err, "provisioning failed");
            self.teardown(&task).await;
            return Err(err);
        }

        info!(
            task_id = %task.id,
            container_id = task.container_id.as_deref().unwrap_or_default(),
            took_ms = started.elapsed().as_millis() as u64,
            "task running"
        );
        Ok(task)
    }

    async fn stop_task(&self, id: Uuid, cancel: &CancellationToken) -> WorkerResult<Task> {
        let mut task = self.store.get_task(id)?;
        check_transition(&task, TaskStatus::Suspended)?;
        let container_id = Self::container_of(&task)?;

        self.call(
            "container stop",
            cancel,
            self.runtime.stop_container(&container_id),
        )
        .await?;

        self.store.set_task_status(&mut task, TaskStatus::Suspended)?;
        info!(task_id = %id, %container_id, "task suspended");
        Ok(task)
    }

    async fn wake_task(&self, id: Uuid, cancel: &CancellationToken) -> WorkerResult<Task> {
        let mut task = self.store.get_task(id)?;
        if task.status == TaskStatus::Running {
            return Ok(task);
        }
        check_transition(&task, TaskStatus::Running)?;
        let container_id = Self::container_of(&task)?;

        self.call(
            "container start",
            cancel,
            self.runtime.start_container(&container_id),
        )
        .await?;

        task.started_at = Some(Utc::now());
        task.status = TaskStatus::Running;
        self.store.update_task(&task)?;
        info!(task_id = %id, %container_id, "task woken");
        Ok(task)
    }

    /// Stops and removes the container, drops the route, then the record.
    /// A failing step aborts and leaves the rest for a retry.
    async fn destroy_task(
        &self,
        id: Uuid,
        force: bool,
        cancel: &CancellationToken,
    ) -> WorkerResult<()> {
        let task = self.store.get_task(id)?;

        let Some(container_id) = task.container_id.as_deref() else {
            self.store.delete_task(id)?;
            info!(task_id = %id, "task destroyed, no container");
            return Ok(());
        };

        if !force {
            self.call(
                "container stop",
                cancel,
                self.runtime.stop_container(container_id),
            )
            .await?;
        }

        self.call(
            "container remove",
            cancel,
            self.runtime.remove_container(container_id, force),
        )
        .await?;

        self.registrar.delist_app(&id.to_string())?;
        self.store.delete_task(id)?;

        info!(task_id = %id, %container_id, force, "task destroyed");
        Ok(())
    }

    fn system_metrics(&self) -> SystemMetrics {
        get_system_metrics(&self.capacity, &self.store)
    }

    async fn list_volumes(&self, cancel: &CancellationToken) -> WorkerResult<Vec<String>> {
        self.call("volume list", cancel, self.runtime.list_volumes())
            .await
    }
}
