use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cluster::{
    Cluster, ContainerRuntime, DockerEnvConfig, DockerEnvironment, Environment, MAX_CLUSTERS,
    VmEnvConfig, VmEnvironment, VmStack,
};
use environment::{AccessInfo, NetworkUsage, ResourceUsage, Status};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::catalog::{Catalog, ClusterDef, EnvKindDef};
use crate::error::{ServiceError, ServiceResult};
use crate::host::HostProbe;
use crate::ports::PortPool;
use crate::registry::{SessionRegistry, ttl_remaining_secs};

/// Tunables the service reads from the environment at startup.
pub struct ServiceConfig {
    pub ttl: Duration,
    pub ttl_poll_interval: Duration,
    pub ttl_extend: Duration,
    /// Minimum session age before an extension is allowed; zero disables
    /// the gate.
    pub ttl_allow_extend_after: Duration,
    pub boot_poll_interval: Duration,
    pub boot_timeout: Duration,
    pub overlays_dir: PathBuf,
    pub base_images_dir: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub status: &'static str,
    pub access_info: BTreeMap<String, AccessInfo>,
}

#[derive(Debug, Serialize)]
pub struct StatusOutcome {
    pub cluster_id: String,
    pub ttl_remaining_seconds: u64,
    pub statuses: BTreeMap<String, Status>,
}

#[derive(Debug, Serialize)]
pub struct AccessOutcome {
    pub access_info: BTreeMap<String, AccessInfo>,
}

#[derive(Debug, Serialize)]
pub struct StopOutcome {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ExtendOutcome {
    pub status: &'static str,
    pub ttl_remaining_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct RunningCluster {
    pub session_id: String,
    pub cluster_name: String,
    pub cluster_id: i64,
}

#[derive(Debug, Serialize)]
pub struct ResourcesSummary {
    pub host: HostSection,
    pub overall: OverallSection,
    pub clusters: Vec<ClusterSection>,
}

#[derive(Debug, Serialize)]
pub struct HostSection {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_total: u64,
    pub network: NetworkUsage,
}

#[derive(Debug, Serialize)]
pub struct OverallSection {
    pub cpu: f32,
    pub memory: u64,
    pub network: NetworkUsage,
}

#[derive(Debug, Serialize)]
pub struct ClusterSection {
    pub session_id: String,
    pub cluster_id: String,
    pub cluster_name: Option<String>,
    pub ttl_remaining_seconds: u64,
    pub resources: ResourceUsage,
}

/// The runtime orchestration service: validates inputs, builds clusters
/// from definitions, and drives their lifecycle against the registry.
pub struct Service {
    config: ServiceConfig,
    catalog: Arc<dyn Catalog>,
    registry: SessionRegistry,
    ports: PortPool,
    runtime: Arc<dyn ContainerRuntime>,
    vm_stack: VmStack,
    host: Arc<dyn HostProbe>,
}

impl Service {
    /// Construct the service and start its TTL sweeper, which runs for
    /// the lifetime of the process.
    pub fn new(
        config: ServiceConfig,
        catalog: Arc<dyn Catalog>,
        ports: PortPool,
        runtime: Arc<dyn ContainerRuntime>,
        vm_stack: VmStack,
        host: Arc<dyn HostProbe>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            config,
            catalog,
            registry: SessionRegistry::new(),
            ports,
            runtime,
            vm_stack,
            host,
        });
        service.spawn_sweeper();
        service
    }

    /// Background loop destroying sessions whose TTL has lapsed.
    /// Concurrent manual stops surface as `NotFound` and are swallowed.
    fn spawn_sweeper(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            // interval() requires a non-zero period.
            let period = service.config.ttl_poll_interval.max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for session_id in service.registry.expired_sessions() {
                    info!(session = %session_id, "session ttl expired, stopping");
                    match service.stop(&session_id).await {
                        Ok(_) | Err(ServiceError::NotFound(_)) => {}
                        Err(e) => {
                            error!(session = %session_id, error = %e, "failed to stop expired session");
                        }
                    }
                }
            }
        });
    }

    fn require_session_id(session_id: &str) -> ServiceResult<()> {
        if session_id.is_empty() {
            return Err(ServiceError::Validation("session_id is required".into()));
        }
        Ok(())
    }

    /// A session id must parse to a session index inside the network
    /// plan, since it seeds the cluster's subnet and bridge name.
    fn parse_session_index(session_id: &str) -> ServiceResult<u32> {
        Self::require_session_id(session_id)?;
        let index: u32 = session_id.parse().map_err(|_| {
            ServiceError::Validation("session_id must be a non-negative integer".into())
        })?;
        if index >= MAX_CLUSTERS {
            return Err(ServiceError::Validation(format!(
                "session_id must be below {MAX_CLUSTERS}"
            )));
        }
        Ok(index)
    }

    /// Provision and start a cluster instance for the session.
    ///
    /// Any failure after resources were claimed compensates in order:
    /// registry entry out, allocated ports released, partial cluster
    /// destroyed (environments, container network, bridge).
    pub async fn run(
        &self,
        cluster_db_id: i64,
        variables: BTreeMap<String, String>,
        session_id: &str,
    ) -> ServiceResult<RunOutcome> {
        let session_index = Self::parse_session_index(session_id)?;

        let def = self
            .catalog
            .cluster(cluster_db_id)
            .await
            .ok_or_else(|| ServiceError::NotFound("Cluster not found".into()))?;

        let mut cluster = Cluster::create(
            Arc::clone(&self.vm_stack.hypervisor),
            Arc::clone(&self.runtime),
            def.id,
            format!("{session_id}-{}", def.name),
            session_index,
        )
        .await?;

        let mut allocated: Vec<u16> = Vec::new();
        if let Err(e) = self
            .populate(&mut cluster, &def, &variables, session_id, &mut allocated)
            .await
        {
            self.ports.release_many(&allocated);
            cluster.destroy().await;
            return Err(e);
        }

        let cluster = Arc::new(cluster);
        self.registry
            .set(session_id, Arc::clone(&cluster), self.config.ttl);

        if let Err(e) = cluster.start().await {
            self.registry.pop(session_id);
            self.ports.release_many(&allocated);
            cluster.destroy().await;
            return Err(e.into());
        }

        info!(session = %session_id, cluster = %cluster.display_name(), "started cluster");
        Ok(RunOutcome {
            status: "started",
            access_info: cluster.access_info(),
        })
    }

    /// Build each defined environment in declaration order, drawing its
    /// published ports from the pool.
    async fn populate(
        &self,
        cluster: &mut Cluster,
        def: &ClusterDef,
        variables: &BTreeMap<String, String>,
        session_id: &str,
        allocated: &mut Vec<u16>,
    ) -> ServiceResult<()> {
        for env_def in &def.environments {
            debug!(env = %env_def.name, definition_id = env_def.id, "building environment");
            let internal_ports = env_def.ports.clone();
            let published_ports = self.ports.allocate_many(internal_ports.len())?;
            allocated.extend(&published_ports);

            let name = format!("{session_id}-{}", env_def.name);
            let env = match &env_def.kind {
                EnvKindDef::Docker(docker) => Environment::Docker(DockerEnvironment::new(
                    Arc::clone(&self.runtime),
                    DockerEnvConfig {
                        name,
                        display_name: env_def.name.clone(),
                        image: docker.image.clone(),
                        internal_ports,
                        published_ports,
                        variables: variables.clone(),
                        access_template: env_def.access_info.clone(),
                        network_name: cluster.container_network().to_string(),
                    },
                )?),
                EnvKindDef::Vm(vm) => {
                    let base_name = vm
                        .base_image_path
                        .rsplit('/')
                        .next()
                        .unwrap_or(vm.base_image_path.as_str());
                    Environment::Vm(
                        VmEnvironment::new(
                            self.vm_stack.clone(),
                            VmEnvConfig {
                                name,
                                display_name: env_def.name.clone(),
                                template: vm.template.clone(),
                                base_image: self.config.base_images_dir.join(base_name),
                                overlay_dir: self.config.overlays_dir.clone(),
                                internal_ports,
                                published_ports,
                                access_template: env_def.access_info.clone(),
                                network_name: cluster.network_name().to_string(),
                                boot_poll_interval: self.config.boot_poll_interval,
                                boot_timeout: self.config.boot_timeout,
                            },
                        )
                        .await?,
                    )
                }
            };
            cluster.add_environment(env);
        }
        Ok(())
    }

    pub async fn status(&self, session_id: &str) -> ServiceResult<StatusOutcome> {
        Self::require_session_id(session_id)?;
        let entry = self
            .registry
            .get_entry(session_id)
            .ok_or_else(|| ServiceError::NotFound("Cluster not found".into()))?;

        let statuses = entry.cluster.status().await?;
        Ok(StatusOutcome {
            cluster_id: entry.cluster.db_id().to_string(),
            ttl_remaining_seconds: ttl_remaining_secs(entry.expires_at),
            statuses,
        })
    }

    pub async fn access_info(&self, session_id: &str) -> ServiceResult<AccessOutcome> {
        Self::require_session_id(session_id)?;
        let cluster = self
            .registry
            .get(session_id)
            .ok_or_else(|| ServiceError::NotFound("Cluster not found".into()))?;
        Ok(AccessOutcome {
            access_info: cluster.access_info(),
        })
    }

    /// Restart every environment. The wire status string stays
    /// `"stopped"` for compatibility with existing callers.
    pub async fn restart(&self, session_id: &str) -> ServiceResult<StopOutcome> {
        Self::require_session_id(session_id)?;
        let cluster = self
            .registry
            .get(session_id)
            .ok_or_else(|| ServiceError::NotFound("Cluster is not running".into()))?;

        cluster.restart().await?;
        info!(session = %session_id, "restarted cluster");
        Ok(StopOutcome { status: "stopped" })
    }

    /// Stop the session: take it out of the registry, return every
    /// published port to the pool, tear the cluster down.
    pub async fn stop(&self, session_id: &str) -> ServiceResult<StopOutcome> {
        Self::require_session_id(session_id)?;
        let entry = self
            .registry
            .pop(session_id)
            .ok_or_else(|| ServiceError::NotFound("Cluster is not running".into()))?;

        self.ports.release_many(&entry.cluster.published_ports());
        entry.cluster.destroy().await;

        info!(session = %session_id, "stopped cluster");
        Ok(StopOutcome { status: "stopped" })
    }

    /// Extend the session TTL, gated on a minimum session age.
    pub async fn extend_ttl(&self, session_id: &str) -> ServiceResult<ExtendOutcome> {
        Self::require_session_id(session_id)?;
        let entry = self
            .registry
            .get_entry(session_id)
            .ok_or_else(|| ServiceError::NotFound("Cluster not found".into()))?;

        if !self.config.ttl_extend.is_zero() {
            let allow_after = self.config.ttl_allow_extend_after;
            if !allow_after.is_zero() {
                let elapsed = entry.created_at.elapsed();
                if elapsed < allow_after {
                    let wait = (allow_after - elapsed).as_secs();
                    return Err(ServiceError::Validation(format!(
                        "TTL can be extended after {}s; try again in {wait}s",
                        allow_after.as_secs()
                    )));
                }
            }
            self.registry.extend(session_id, self.config.ttl_extend);
        }

        let remaining = self
            .registry
            .get_entry(session_id)
            .map(|entry| ttl_remaining_secs(entry.expires_at))
            .unwrap_or(0);
        Ok(ExtendOutcome {
            status: "extended",
            ttl_remaining_seconds: remaining,
        })
    }

    /// Live sessions whose definition still exists in the catalog.
    pub async fn running_clusters(&self) -> Vec<RunningCluster> {
        let mut result = Vec::new();
        for (session_id, entry) in self.registry.items() {
            let Some(def) = self.catalog.cluster(entry.cluster.db_id()).await else {
                continue;
            };
            result.push(RunningCluster {
                session_id,
                cluster_name: def.name,
                cluster_id: def.id,
            });
        }
        result
    }

    /// Host metrics plus per-cluster usage, with an overall sum.
    pub async fn resources_summary(&self) -> ResourcesSummary {
        let host = self.host.sample().await;

        let mut overall = OverallSection {
            cpu: host.cpu_percent,
            memory: 0,
            network: NetworkUsage::default(),
        };
        let mut clusters = Vec::new();

        for (session_id, entry) in self.registry.items() {
            let resources = entry.cluster.resources().await;
            let def = self.catalog.cluster(entry.cluster.db_id()).await;

            overall.memory = overall.memory.saturating_add(resources.total.memory);
            overall.network.rx = overall.network.rx.saturating_add(resources.total.network.rx);
            overall.network.tx = overall.network.tx.saturating_add(resources.total.network.tx);

            clusters.push(ClusterSection {
                session_id,
                cluster_id: entry.cluster.db_id().to_string(),
                cluster_name: def.map(|d| d.name),
                ttl_remaining_seconds: ttl_remaining_secs(entry.expires_at),
                resources: resources.total,
            });
        }

        ResourcesSummary {
            host: HostSection {
                cpu_percent: host.cpu_percent,
                memory_percent: host.memory_percent,
                memory_total: host.memory_total,
                network: host.network,
            },
            overall,
            clusters,
        }
    }

    /// Number of live sessions, for liveness assertions in tests.
    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.registry.items().len()
    }

    #[cfg(test)]
    pub fn free_port_count(&self) -> usize {
        self.ports.free_count()
    }
}
