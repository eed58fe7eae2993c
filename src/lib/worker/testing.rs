//! Shared fixtures for the worker tests.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::config::WorkerConfig;
use super::types::{HostCapacity, Worker};
use crate::lib::proxy::registrar::FileRegistrar;
use crate::lib::store::task_store::TaskStore;
use crate::lib::tasks::fake::FakeRuntime;
use crate::lib::tasks::types::TaskDefinition;

pub struct Harness {
    pub worker: Arc<Worker>,
    pub store: Arc<TaskStore>,
    pub runtime: Arc<FakeRuntime>,
    pub registrar: Arc<FileRegistrar>,
    _dir: TempDir,
}

impl Harness {
    pub fn new(total_cpu: usize) -> Self {
        Self::build(
            total_cpu,
            TaskStore::open_in_memory().unwrap(),
            Duration::from_secs(5),
        )
    }

    pub fn build(total_cpu: usize, store: TaskStore, runtime_timeout: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let config = WorkerConfig {
            data_dir: dir.path().to_path_buf(),
            proxy_config_path: dir.path().join("rpxy").join("rpxy.toml"),
            runtime_timeout,
            watch_interval: Duration::from_millis(10),
            worker_id: "test-worker".to_string(),
            ..Default::default()
        };

        let store = Arc::new(store);
        let runtime = Arc::new(FakeRuntime::new());
        let registrar = Arc::new(FileRegistrar::new(config.proxy_settings()).unwrap());

        let worker = Arc::new(Worker::new(
            config,
            store.clone(),
            runtime.clone(),
            registrar.clone(),
            HostCapacity::new(total_cpu, 16 << 30),
        ));

        Harness {
            worker,
            store,
            runtime,
            registrar,
            _dir: dir,
        }
    }
}

pub fn definition(cpu: f64, exposed_ports: Vec<u16>) -> TaskDefinition {
    TaskDefinition {
        app_name: "web".into(),
        deployment_name: "blue".into(),
        stack_name: "shop".into(),
        image: "nginx:1.27".into(),
        cpu: Some(cpu),
        memory: Some(64 << 20),
        exposed_ports,
    }
}
