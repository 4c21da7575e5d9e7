use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, MemoryStatsStats, NetworkingConfig,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StatsOptions,
    StopContainerOptions,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::secret::{EndpointSettings, HostConfig, Ipam, IpamConfig, PortBinding};
use futures_util::StreamExt;
use ipnet::Ipv4Net;
use tracing::{trace, warn};

/// Container driver failure, wrapping the runtime's error kind.
#[derive(Debug, thiserror::Error)]
pub enum DockerEnvError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("container error: {0}")]
    Container(String),

    #[error("container api error: {0}")]
    Api(String),

    #[error("container runtime error: {0}")]
    Runtime(String),
}

/// One-shot usage sample for a running container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub memory_usage: u64,
    pub memory_cache: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Everything needed to launch one detached container.
pub struct ContainerSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    /// Container network to attach to.
    pub network: &'a str,
    /// `(internal, published)` port pairs, pairwise ordered.
    pub ports: &'a [(u16, u16)],
    pub variables: &'a BTreeMap<String, String>,
}

/// Facade over the container runtime.
///
/// Containers are addressed by the name the orchestrator assigned them,
/// which the runtime accepts anywhere an id is accepted.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a bridge network whose L2 device is the given host bridge,
    /// with explicit IPAM. An existing network of the same name is
    /// looked up and reused.
    async fn create_network(
        &self,
        name: &str,
        bridge: &str,
        subnet: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> Result<(), DockerEnvError>;

    async fn remove_network(&self, name: &str) -> Result<(), DockerEnvError>;

    /// Create and start a detached container.
    async fn run_container(&self, spec: ContainerSpec<'_>) -> Result<(), DockerEnvError>;

    async fn restart_container(&self, name: &str) -> Result<(), DockerEnvError>;

    /// Stop (best-effort) and remove a container.
    async fn remove_container(&self, name: &str) -> Result<(), DockerEnvError>;

    /// The runtime's textual container state (e.g. "running").
    async fn container_state(&self, name: &str) -> Result<String, DockerEnvError>;

    /// Container IP on `network`, falling back to the first attached
    /// network that has one.
    async fn container_ip(&self, name: &str, network: &str)
    -> Result<Option<String>, DockerEnvError>;

    async fn container_stats(&self, name: &str) -> Result<ContainerStats, DockerEnvError>;
}

/// Production runtime over the Docker Engine API.
pub struct DockerApi {
    docker: Docker,
}

impl DockerApi {
    pub fn connect() -> Result<Self, DockerEnvError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerEnvError::Runtime(format!("connect to docker: {e}")))?;
        Ok(Self { docker })
    }
}

/// Map a runtime error for container creation, where a 404 means the
/// image is unknown and a 409 a name conflict.
fn create_error(image: &str, e: bollard::errors::Error) -> DockerEnvError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => DockerEnvError::ImageNotFound(image.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => DockerEnvError::Container(message),
        other => api_error(other),
    }
}

fn api_error(e: bollard::errors::Error) -> DockerEnvError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => DockerEnvError::Api(format!("status {status_code}: {message}")),
        other => DockerEnvError::Runtime(other.to_string()),
    }
}

fn is_name_conflict(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

type ExposedPorts = HashMap<String, HashMap<(), ()>>;
type PortBindings = HashMap<String, Option<Vec<PortBinding>>>;

fn build_port_maps(ports: &[(u16, u16)]) -> (ExposedPorts, PortBindings) {
    let mut exposed = HashMap::new();
    let mut bindings = HashMap::new();
    for (internal, published) in ports {
        let key = format!("{internal}/tcp");
        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(published.to_string()),
            }]),
        );
    }
    (exposed, bindings)
}

#[async_trait]
impl ContainerRuntime for DockerApi {
    async fn create_network(
        &self,
        name: &str,
        bridge: &str,
        subnet: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> Result<(), DockerEnvError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            options: HashMap::from([(
                "com.docker.network.bridge.name".to_string(),
                bridge.to_string(),
            )]),
            ipam: Ipam {
                driver: Some("default".to_string()),
                config: Some(vec![IpamConfig {
                    subnet: Some(subnet.to_string()),
                    gateway: Some(gateway.to_string()),
                    ..Default::default()
                }]),
                options: None,
            },
            ..Default::default()
        };

        match self.docker.create_network(options).await {
            Ok(_) => Ok(()),
            Err(e) if is_name_conflict(&e) => {
                warn!(network = %name, "network already exists, reusing");
                self.docker
                    .inspect_network(name, None::<InspectNetworkOptions<String>>)
                    .await
                    .map(|_| ())
                    .map_err(api_error)
            }
            Err(e) => Err(api_error(e)),
        }
    }

    async fn remove_network(&self, name: &str) -> Result<(), DockerEnvError> {
        self.docker.remove_network(name).await.map_err(api_error)
    }

    async fn run_container(&self, spec: ContainerSpec<'_>) -> Result<(), DockerEnvError> {
        let (exposed, bindings) = build_port_maps(spec.ports);
        let env: Vec<String> = spec
            .variables
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let config = Config {
            image: Some(spec.image.to_string()),
            env: Some(env),
            exposed_ports: Some(exposed),
            host_config: Some(HostConfig {
                port_bindings: Some(bindings),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    spec.network.to_string(),
                    EndpointSettings::default(),
                )]),
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| create_error(spec.image, e))?;

        self.docker
            .start_container(spec.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(api_error)
    }

    async fn restart_container(&self, name: &str) -> Result<(), DockerEnvError> {
        self.docker
            .restart_container(name, None::<RestartContainerOptions>)
            .await
            .map_err(api_error)
    }

    async fn remove_container(&self, name: &str) -> Result<(), DockerEnvError> {
        if let Err(e) = self
            .docker
            .stop_container(name, None::<StopContainerOptions>)
            .await
        {
            // Already-stopped containers report 304; anything else still
            // gets a removal attempt below.
            trace!(container = %name, error = %e, "stop before remove failed");
        }
        self.docker
            .remove_container(name, None::<RemoveContainerOptions>)
            .await
            .map_err(api_error)
    }

    async fn container_state(&self, name: &str) -> Result<String, DockerEnvError> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(api_error)?;
        Ok(inspect
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default())
    }

    async fn container_ip(
        &self,
        name: &str,
        network: &str,
    ) -> Result<Option<String>, DockerEnvError> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(api_error)?;
        let Some(networks) = inspect.network_settings.and_then(|s| s.networks) else {
            return Ok(None);
        };

        let ip_of = |endpoint: &EndpointSettings| {
            endpoint
                .ip_address
                .as_ref()
                .filter(|ip| !ip.is_empty())
                .cloned()
        };

        if let Some(ip) = networks.get(network).and_then(ip_of) {
            return Ok(Some(ip));
        }
        Ok(networks.values().find_map(ip_of))
    }

    async fn container_stats(&self, name: &str) -> Result<ContainerStats, DockerEnvError> {
        let mut stream = self.docker.stats(
            name,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let stats = stream
            .next()
            .await
            .ok_or_else(|| DockerEnvError::Api(format!("no stats sample for {name}")))?
            .map_err(api_error)?;

        let memory_usage = stats.memory_stats.usage.unwrap_or(0);
        let memory_cache = match stats.memory_stats.stats {
            Some(MemoryStatsStats::V1(v1)) => v1.cache,
            Some(MemoryStatsStats::V2(v2)) => v2.file,
            None => 0,
        };

        let (rx_bytes, tx_bytes) = stats
            .networks
            .map(|networks| {
                networks.values().fold((0u64, 0u64), |(rx, tx), n| {
                    (rx.saturating_add(n.rx_bytes), tx.saturating_add(n.tx_bytes))
                })
            })
            .unwrap_or((0, 0));

        Ok(ContainerStats {
            memory_usage,
            memory_cache,
            rx_bytes,
            tx_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_maps_pair_internal_with_published() {
        let (exposed, bindings) = build_port_maps(&[(80, 31010), (22, 31005)]);
        assert!(exposed.contains_key("80/tcp"));
        assert!(exposed.contains_key("22/tcp"));

        let binding = bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("31010"));
        let binding = bindings["22/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("31005"));
    }

    #[test]
    fn create_error_distinguishes_missing_image() {
        let e = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such image".into(),
        };
        assert!(matches!(
            create_error("echo:1", e),
            DockerEnvError::ImageNotFound(image) if image == "echo:1"
        ));
    }

    #[test]
    fn create_error_maps_name_conflict() {
        let e = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name in use".into(),
        };
        assert!(matches!(
            create_error("echo:1", e),
            DockerEnvError::Container(_)
        ));
    }

    #[test]
    fn api_error_carries_status_code() {
        let e = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        match api_error(e) {
            DockerEnvError::Api(msg) => assert!(msg.contains("500"), "got: {msg}"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
