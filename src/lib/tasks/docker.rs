use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
        StartContainerOptions,
    },
    image::CreateImageOptions,
    network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions},
    secret::{HostConfig, PortBinding},
};
use futures_util::stream::StreamExt;
use tracing::{debug, info};

use super::types::{ContainerSpec, ContainerState, ImageRef, TaskResult};

/// Label marking containers and networks owned by this worker.
pub const MANAGED_LABEL: &str = "cube.managed";
/// Label carrying the task id; the watcher maps containers back to tasks through it.
pub const TASK_ID_LABEL: &str = "cube.task_id";
pub const QUALIFIED_NAME_LABEL: &str = "cube.qualified_name";

/// The slice of a container runtime the worker depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &ImageRef) -> TaskResult<()>;

    /// Returns the network id when a network with exactly this name exists.
    async fn find_network(&self, name: &str) -> TaskResult<Option<String>>;

    /// Creates a bridge network and returns a handle usable by `connect_network`.
    async fn create_network(&self, name: &str) -> TaskResult<String>;

    async fn connect_network(&self, network: &str, container_id: &str) -> TaskResult<()>;

    async fn create_container(&self, spec: &ContainerSpec) -> TaskResult<String>;

    async fn start_container(&self, container_id: &str) -> TaskResult<()>;

    async fn stop_container(&self, container_id: &str) -> TaskResult<()>;

    async fn remove_container(&self, container_id: &str, force: bool) -> TaskResult<()>;

    /// All containers, stopped ones included.
    async fn list_containers(&self) -> TaskResult<Vec<ContainerState>>;

    async fn list_volumes(&self) -> TaskResult<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    pub client: Docker,
}

impl DockerRuntime {
    pub async fn connect() -> TaskResult<Self> {
        let client = Docker::connect_with_local_defaults()?;
        client.ping().await?;
        Ok(DockerRuntime { client })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &ImageRef) -> TaskResult<()> {
        info!(image = %image.full_name, "pulling image");

        let tag = image.digest.clone().unwrap_or_else(|| image.tag.clone());
        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.canonical_name(),
                tag,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(msg) = stream.next().await {
            let info = msg?;
            if let Some(status) = info.status {
                debug!(image = %image.full_name, %status, "pull progress");
            }
        }

        info!(image = %image.full_name, "image pulled");
        Ok(())
    }

    async fn find_network(&self, name: &str) -> TaskResult<Option<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let networks = self
            .client
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;

        // the name filter matches substrings
        Ok(networks
            .into_iter()
            .find(|net| net.name.as_deref() == Some(name))
            .map(|net| net.id.unwrap_or_else(|| name.to_string())))
    }

    async fn create_network(&self, name: &str) -> TaskResult<String> {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "1".to_string());

        self.client
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                enable_ipv6: false,
                labels,
                ..Default::default()
            })
            .await?;

        info!(network = %name, "network created");
        Ok(name.to_string())
    }

    async fn connect_network(&self, network: &str, container_id: &str) -> TaskResult<()> {
        self.client
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container_id.to_string(),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> TaskResult<String> {
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .port_bindings
            .iter()
            .map(|(host_port, container_port)| {
                (
                    format!("{}/tcp", container_port),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(host_port.to_string()),
                    }]),
                )
            })
            .collect();

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .port_bindings
            .values()
            .map(|container_port| (format!("{}/tcp", container_port), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            network_mode: Some(spec.network_mode.clone()),
            port_bindings: Some(port_bindings),
            nano_cpus: Some(spec.nano_cpus),
            memory: Some(spec.memory),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            attach_stdout: Some(true),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        });

        let resp = self
            .client
            .create_container(options, container_config)
            .await?;

        info!(container_id = %resp.id, name = %spec.name, "container created");
        Ok(resp.id)
    }

    async fn start_container(&self, container_id: &str) -> TaskResult<()> {
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        info!(%container_id, "container started");
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> TaskResult<()> {
        self.client.stop_container(container_id, None).await?;
        info!(%container_id, "container stopped");
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> TaskResult<()> {
        self.client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?;
        info!(%container_id, force, "container removed");
        Ok(())
    }

    async fn list_containers(&self) -> TaskResult<Vec<ContainerState>> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|summary| ContainerState {
                id: summary.id.unwrap_or_default(),
                labels: summary.labels.unwrap_or_default(),
                status: summary.status.unwrap_or_default(),
            })
            .collect())
    }

    async fn list_volumes(&self) -> TaskResult<Vec<String>> {
        let resp = self.client.list_volumes::<String>(None).await?;
        Ok(resp
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| volume.name)
            .collect())
    }
}
