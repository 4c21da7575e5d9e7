use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use environment::{AccessInfo, ResourceUsage, Status, ports, render_access_info};
use tracing::{info, warn};

use crate::error::EnvError;
use crate::runtime::{ContainerRuntime, ContainerSpec, DockerEnvError};

/// Static description of one container environment instance.
pub struct DockerEnvConfig {
    /// Container name, unique per session (`<session>-<env>`).
    pub name: String,
    /// Operator-facing name from the definition.
    pub display_name: String,
    pub image: String,
    pub internal_ports: Vec<u16>,
    pub published_ports: Vec<u16>,
    pub variables: BTreeMap<String, String>,
    pub access_template: String,
    /// Container network the instance attaches to.
    pub network_name: String,
}

/// One container workload. Cheap to clone; all mutable state lives
/// behind the shared inner.
#[derive(Clone)]
pub struct DockerEnvironment {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DockerEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerEnvironment")
            .field("name", &self.inner.config.name)
            .finish_non_exhaustive()
    }
}

struct Inner {
    runtime: Arc<dyn ContainerRuntime>,
    config: DockerEnvConfig,
    /// Container handle once started (the assigned name).
    handle: Mutex<Option<String>>,
    ip: Mutex<Option<String>>,
}

impl DockerEnvironment {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: DockerEnvConfig) -> Result<Self, EnvError> {
        ports::validate_mapping(&config.internal_ports, &config.published_ports).map_err(
            |detail| EnvError::PortMapping {
                name: config.name.clone(),
                detail,
            },
        )?;

        info!(name = %config.name, image = %config.image, "created docker environment");
        Ok(Self {
            inner: Arc::new(Inner {
                runtime,
                config,
                handle: Mutex::new(None),
                ip: Mutex::new(None),
            }),
        })
    }

    pub fn display_name(&self) -> &str {
        &self.inner.config.display_name
    }

    pub fn published_ports(&self) -> &[u16] {
        &self.inner.config.published_ports
    }

    fn handle(&self) -> Option<String> {
        self.inner.handle.lock().ok().and_then(|h| h.clone())
    }

    fn port_pairs(&self) -> Vec<(u16, u16)> {
        ports::pairs(
            &self.inner.config.internal_ports,
            &self.inner.config.published_ports,
        )
    }

    /// Launch the detached container and record its network address.
    pub async fn start(&self) -> Result<(), DockerEnvError> {
        let config = &self.inner.config;
        let pairs = self.port_pairs();
        self.inner
            .runtime
            .run_container(ContainerSpec {
                name: &config.name,
                image: &config.image,
                network: &config.network_name,
                ports: &pairs,
                variables: &config.variables,
            })
            .await?;

        if let Ok(mut handle) = self.inner.handle.lock() {
            *handle = Some(config.name.clone());
        }

        match self
            .inner
            .runtime
            .container_ip(&config.name, &config.network_name)
            .await
        {
            Ok(ip) => {
                if let Ok(mut slot) = self.inner.ip.lock() {
                    *slot = ip;
                }
            }
            Err(e) => warn!(name = %config.name, error = %e, "failed to read container ip"),
        }

        info!(name = %config.name, "started docker environment");
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), DockerEnvError> {
        let Some(handle) = self.handle() else {
            warn!(name = %self.inner.config.name, "tried to restart an environment that was not started");
            return Err(DockerEnvError::Container(format!(
                "container {} has not started yet",
                self.inner.config.name
            )));
        };

        self.inner.runtime.restart_container(&handle).await?;
        info!(name = %self.inner.config.name, "restarted docker environment");
        Ok(())
    }

    pub async fn status(&self) -> Result<Status, DockerEnvError> {
        let Some(handle) = self.handle() else {
            return Ok(Status::Unknown);
        };
        let state = self.inner.runtime.container_state(&handle).await?;
        Ok(Status::from_container_state(&state))
    }

    pub fn access_info(&self) -> AccessInfo {
        let ip = self.inner.ip.lock().ok().and_then(|ip| ip.clone());
        render_access_info(
            &self.inner.config.access_template,
            ip.as_deref(),
            &self.port_pairs(),
        )
    }

    /// Usage sample: memory is `usage - cache` floored at zero, traffic
    /// is summed across attached networks. Read errors yield zeros.
    pub async fn resources(&self) -> ResourceUsage {
        let Some(handle) = self.handle() else {
            return ResourceUsage::default();
        };
        match self.inner.runtime.container_stats(&handle).await {
            Ok(stats) => ResourceUsage::new(
                stats.memory_usage.saturating_sub(stats.memory_cache),
                stats.rx_bytes,
                stats.tx_bytes,
            ),
            Err(e) => {
                warn!(name = %self.inner.config.name, error = %e, "failed to read container stats");
                ResourceUsage::default()
            }
        }
    }

    /// Stop and remove the container. Safe to call repeatedly; a second
    /// call (or a destroy before start) is a logged no-op.
    pub async fn destroy(&self) {
        let handle = self.inner.handle.lock().ok().and_then(|mut h| h.take());
        let Some(handle) = handle else {
            warn!(name = %self.inner.config.name, "tried to remove an environment that was not started");
            return;
        };

        if let Err(e) = self.inner.runtime.remove_container(&handle).await {
            warn!(name = %self.inner.config.name, error = %e, "failed to remove container");
            return;
        }
        info!(name = %self.inner.config.name, "removed docker environment");
    }
}
