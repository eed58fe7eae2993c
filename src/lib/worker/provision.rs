//! The multi-step start pipeline and its best-effort teardown.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::io;
use std::net::TcpListener;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{Worker, WorkerError, WorkerResult};
use crate::lib::tasks::docker::{
    ContainerRuntime, MANAGED_LABEL, QUALIFIED_NAME_LABEL, TASK_ID_LABEL,
};
use crate::lib::tasks::state::valid_state_transition;
use crate::lib::tasks::types::{ContainerSpec, Task, TaskError, TaskResult, TaskStatus};

const PORT_PROBE_ATTEMPTS: usize = 32;

/// Awaits a runtime call unless the caller cancels first or `deadline` passes.
pub async fn guarded<T, F>(
    op: &'static str,
    cancel: &CancellationToken,
    deadline: Duration,
    fut: F,
) -> WorkerResult<T>
where
    F: Future<Output = TaskResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WorkerError::Cancelled(op)),
        res = tokio::time::timeout(deadline, fut) => match res {
            Ok(res) => res.map_err(WorkerError::from),
            Err(_) => Err(WorkerError::DeadlineExceeded(op)),
        },
    }
}

pub fn check_transition(task: &Task, to: TaskStatus) -> WorkerResult<()> {
    if valid_state_transition(&task.status, &to) {
        Ok(())
    } else {
        Err(WorkerError::InvalidStateTransition {
            id: task.id,
            from: task.status,
            to,
        })
    }
}

async fn find_or_create_network(runtime: &dyn ContainerRuntime, name: &str) -> TaskResult<String> {
    if let Some(network_id) = runtime.find_network(name).await? {
        debug!(network = %name, "reusing network");
        return Ok(network_id);
    }

    runtime.create_network(name).await
}

/// Asks the kernel for an ephemeral port, skipping ports already recorded on
/// other tasks.
fn allocate_host_port(taken: &BTreeSet<u16>) -> io::Result<u16> {
    for _ in 0..PORT_PROBE_ATTEMPTS {
        let port = TcpListener::bind(("0.0.0.0", 0))?.local_addr()?.port();
        if !taken.contains(&port) {
            return Ok(port);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "could not find a free host port",
    ))
}

impl Worker {
    pub(super) async fn call<T, F>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        fut: F,
    ) -> WorkerResult<T>
    where
        F: Future<Output = TaskResult<T>>,
    {
        guarded(op, cancel, self.config.runtime_timeout, fut).await
    }

    fn advance(&self, task: &mut Task, to: TaskStatus) -> WorkerResult<()> {
        check_transition(task, to)?;
        self.store.set_task_status(task, to)?;
        Ok(())
    }

    /// Drives a freshly stored task from Pending to Running.
    pub(super) async fn provision(
        &self,
        task: &mut Task,
        exposed_ports: &[u16],
        cancel: &CancellationToken,
    ) -> WorkerResult<()> {
        self.advance(task, TaskStatus::ImagePull)?;

        let network_name = task.network_name();
        let (_, network) = tokio::try_join!(
            self.call("image pull", cancel, self.runtime.pull_image(&task.image)),
            self.call(
                "network resolution",
                cancel,
                find_or_create_network(self.runtime.as_ref(), &network_name),
            ),
        )?;

        self.advance(task, TaskStatus::Creating)?;
        let port_bindings = self.bind_ports(task, exposed_ports)?;

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "1".to_string());
        labels.insert(TASK_ID_LABEL.to_string(), task.id.to_string());
        labels.insert(QUALIFIED_NAME_LABEL.to_string(), task.qualified_name());

        let spec = ContainerSpec {
            name: task.id.to_string(),
            image: task.image.reference(),
            labels,
            port_bindings,
            network_mode: "bridge".to_string(),
            nano_cpus: (task.cpu * 1_000_000_000.0) as i64,
            memory: i64::try_from(task.memory).unwrap_or(i64::MAX),
        };

        let container_id = match self
            .call("container create", cancel, self.runtime.create_container(&spec))
            .await
        {
            Ok(container_id) => container_id,
            Err(err @ (WorkerError::Cancelled(_) | WorkerError::DeadlineExceeded(_))) => {
                // the runtime may have created it anyway; its name is a valid handle
                task.container_id = Some(spec.name.clone());
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        // recorded before persisting so a failed write still tears the container down
        task.container_id = Some(container_id.clone());
        check_transition(task, TaskStatus::Starting)?;
        task.status = TaskStatus::Starting;
        self.store.update_task(task)?;

        self.call(
            "network connect",
            cancel,
            self.runtime.connect_network(&network, &container_id),
        )
        .await?;

        self.call(
            "container start",
            cancel,
            self.runtime.start_container(&container_id),
        )
        .await?;

        check_transition(task, TaskStatus::Running)?;
        task.started_at = Some(Utc::now());
        task.status = TaskStatus::Running;
        self.store.update_task(task)?;

        Ok(())
    }

    /// Picks a host port for every exposed container port, records the
    /// bindings on `task` and routes each through the proxy.
    fn bind_ports(
        &self,
        task: &mut Task,
        exposed_ports: &[u16],
    ) -> WorkerResult<BTreeMap<u16, u16>> {
        let mut taken: BTreeSet<u16> = self
            .store
            .get_tasks()?
            .iter()
            .flat_map(|t| t.host_port_bindings.keys().copied())
            .collect();

        for &container_port in exposed_ports {
            let host_port = allocate_host_port(&taken)?;
            taken.insert(host_port);
            task.host_port_bindings.insert(host_port, container_port);
            debug!(task_id = %task.id, host_port, container_port, "port bound");
        }

        self.publish_routes(task)?;
        Ok(task.host_port_bindings.clone())
    }

    /// Registers the task's bound host ports with the proxy. Routes are keyed
    /// by task id, so the highest host port is the one that ends up routed.
    pub(super) fn publish_routes(&self, task: &Task) -> WorkerResult<()> {
        let id = task.id.to_string();
        let name = task.qualified_name();
        let domain = task.domain();

        for &host_port in task.host_port_bindings.keys() {
            self.registrar.register_app(&id, &name, &domain, host_port)?;
        }
        Ok(())
    }

    /// Undoes whatever `provision` got through. Runs to completion regardless
    /// of the caller's token; failures are logged.
    pub(super) async fn teardown(&self, task: &Task) {
        let detached = CancellationToken::new();

        if let Some(container_id) = &task.container_id {
            if let Err(err) = self
                .call(
                    "teardown container remove",
                    &detached,
                    self.runtime.remove_container(container_id, true),
                )
                .await
            {
                warn!(task_id = %task.id, %container_id, error = %err, "teardown: could not remove container");
            }
        }

        if let Err(err) = self.registrar.delist_app(&task.id.to_string()) {
            warn!(task_id = %task.id, error = %err, "teardown: could not delist route");
        }

        match self.store.delete_task(task.id) {
            Ok(()) | Err(TaskError::NotFound(_)) => {
                info!(task_id = %task.id, "teardown complete")
            }
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "teardown: could not delete task, capacity stays reserved")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_port_avoids_taken_ports() {
        let first = allocate_host_port(&BTreeSet::new()).unwrap();
        let taken: BTreeSet<u16> = [first].into_iter().collect();
        let second = allocate_host_port(&taken).unwrap();
        assert_ne!(first, second);
        assert_ne!(second, 0);
    }

    #[tokio::test]
    async fn guarded_reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res: WorkerResult<()> = guarded(
            "sleep",
            &cancel,
            Duration::from_secs(5),
            std::future::pending::<TaskResult<()>>(),
        )
        .await;
        assert!(matches!(res, Err(WorkerError::Cancelled("sleep"))));
    }

    #[tokio::test]
    async fn guarded_reports_deadline() {
        let cancel = CancellationToken::new();

        let res: WorkerResult<()> = guarded(
            "sleep",
            &cancel,
            Duration::from_millis(10),
            std::future::pending::<TaskResult<()>>(),
        )
        .await;
        assert!(matches!(res, Err(WorkerError::DeadlineExceeded("sleep"))));
    }
}
