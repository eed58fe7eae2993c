//! In-memory runtime used by the worker tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::docker::ContainerRuntime;
use super::types::{ContainerSpec, ContainerState, ImageRef, TaskError, TaskResult};

#[derive(Default)]
pub struct FakeRuntime {
    calls: Mutex<Vec<String>>,
    containers: Mutex<HashMap<String, ContainerState>>,
    specs: Mutex<HashMap<String, ContainerSpec>>,
    networks: Mutex<HashMap<String, String>>,
    fail_on: Mutex<Option<&'static str>>,
    next_id: Mutex<u64>,
    create_delay: Mutex<Option<Duration>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call of `op` (e.g. `"start_container"`) fail.
    pub fn fail_on(&self, op: &'static str) {
        *self.fail_on.lock() = Some(op);
    }

    /// Makes `create_container` register the container, then stall for `delay`.
    pub fn delay_create(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn spec(&self, container_id: &str) -> Option<ContainerSpec> {
        self.specs.lock().get(container_id).cloned()
    }

    pub fn add_container(&self, state: ContainerState) {
        self.containers.lock().insert(state.id.clone(), state);
    }

    pub fn set_status(&self, container_id: &str, status: &str) {
        if let Some(state) = self.containers.lock().get_mut(container_id) {
            state.status = status.to_string();
        }
    }

    fn record(&self, op: &'static str) -> TaskResult<()> {
        self.calls.lock().push(op.to_string());
        if *self.fail_on.lock() == Some(op) {
            return Err(TaskError::Runtime(format!("{} failed", op)));
        }
        Ok(())
    }

    fn with_container<F>(&self, container_id: &str, f: F) -> TaskResult<()>
    where
        F: FnOnce(&mut ContainerState),
    {
        match self.containers.lock().get_mut(container_id) {
            Some(state) => {
                f(state);
                Ok(())
            }
            None => Err(TaskError::Runtime(format!(
                "no such container: {}",
                container_id
            ))),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull_image(&self, _image: &ImageRef) -> TaskResult<()> {
        self.record("pull_image")
    }

    async fn find_network(&self, name: &str) -> TaskResult<Option<String>> {
        self.record("find_network")?;
        Ok(self.networks.lock().get(name).cloned())
    }

    async fn create_network(&self, name: &str) -> TaskResult<String> {
        self.record("create_network")?;
        let id = format!("net-{}", name);
        self.networks.lock().insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn connect_network(&self, _network: &str, container_id: &str) -> TaskResult<()> {
        self.record("connect_network")?;
        self.with_container(container_id, |_| ())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> TaskResult<String> {
        self.record("create_container")?;
        let id = {
            let mut next_id = self.next_id.lock();
            *next_id += 1;
            format!("ctr-{}", *next_id)
        };
        self.add_container(ContainerState {
            id: id.clone(),
            labels: spec.labels.clone(),
            status: "Created".to_string(),
        });
        self.specs.lock().insert(id.clone(), spec.clone());

        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> TaskResult<()> {
        self.record("start_container")?;
        self.with_container(container_id, |state| {
            state.status = "Up 1 second".to_string()
        })
    }

    async fn stop_container(&self, container_id: &str) -> TaskResult<()> {
        self.record("stop_container")?;
        self.with_container(container_id, |state| {
            state.status = "Exited (0) 1 second ago".to_string()
        })
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> TaskResult<()> {
        self.record("remove_container")?;
        // like the real runtime, accept the container name as well as its id
        let id = {
            let specs = self.specs.lock();
            specs
                .iter()
                .find(|(_, spec)| spec.name == container_id)
                .map_or_else(|| container_id.to_string(), |(id, _)| id.clone())
        };

        self.containers
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| TaskError::Runtime(format!("no such container: {}", container_id)))
    }

    async fn list_containers(&self) -> TaskResult<Vec<ContainerState>> {
        self.record("list_containers")?;
        Ok(self.containers.lock().values().cloned().collect())
    }

    async fn list_volumes(&self) -> TaskResult<Vec<String>> {
        self.record("list_volumes")?;
        Ok(vec!["cube-data".to_string()])
    }
}
