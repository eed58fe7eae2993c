use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::lib::{
    proxy::{registrar::FileRegistrar, types::Registrar},
    store::task_store::TaskStore,
    tasks::docker::DockerRuntime,
    worker::{
        config::WorkerConfig,
        identity::resolve_worker_id,
        types::{HostCapacity, TaskServer, Worker},
        watcher::Watcher,
    },
};

mod lib {
    pub mod proxy;
    pub mod store;
    pub mod tasks;
    pub mod worker;
}

const WORKER_API_APP: &str = "cube-worker-api";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = WorkerConfig::from_env();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let override_id = Some(config.worker_id.clone());
    config.worker_id =
        resolve_worker_id(&config.data_dir, override_id).context("resolving worker id")?;

    let store = Arc::new(
        TaskStore::open(config.store_path())
            .with_context(|| format!("opening task store {}", config.store_path().display()))?,
    );

    let registrar = Arc::new(
        FileRegistrar::new(config.proxy_settings()).context("initialising proxy config")?,
    );
    registrar
        .register_app(WORKER_API_APP, WORKER_API_APP, WORKER_API_APP, config.api_port)
        .context("registering worker api route")?;

    let runtime = Arc::new(
        DockerRuntime::connect()
            .await
            .context("connecting to the container runtime")?,
    );

    let capacity = HostCapacity::detect();
    info!(
        worker_id = %config.worker_id,
        total_cpu = capacity.total_cpu,
        total_mem = capacity.total_mem,
        store = %config.store_path().display(),
        "worker starting"
    );

    let watcher = Watcher::new(
        store.clone(),
        runtime.clone(),
        config.watch_interval,
        config.runtime_timeout,
    )
    .spawn();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(err) => warn!(error = %err, "could not listen for ctrl-c, shutting down"),
            }
            shutdown.cancel();
        }
    });

    let worker = Arc::new(Worker::new(
        config.clone(),
        store,
        runtime,
        registrar,
        capacity,
    ));
    worker.restore_routes().context("restoring proxy routes")?;

    let server = TaskServer::new(worker, &config, shutdown);
    let served = server.start_server().await;

    watcher.shutdown().await;
    served.context("serving worker api")?;

    info!("worker stopped");
    Ok(())
}
