use std::collections::BTreeMap;
use std::sync::Arc;

use environment::{AccessInfo, ResourceUsage, Status};
use serde::Serialize;
use tracing::info;

use crate::docker_env::DockerEnvironment;
use crate::error::{ClusterError, EnvError};
use crate::hypervisor::Hypervisor;
use crate::runtime::ContainerRuntime;
use crate::vm_env::VmEnvironment;
use crate::{bridge, docker_network, netplan};

/// One workload of a cluster, dispatching over the two drivers.
#[derive(Clone, Debug)]
pub enum Environment {
    Docker(DockerEnvironment),
    Vm(VmEnvironment),
}

impl Environment {
    pub fn display_name(&self) -> &str {
        match self {
            Self::Docker(env) => env.display_name(),
            Self::Vm(env) => env.display_name(),
        }
    }

    pub fn published_ports(&self) -> &[u16] {
        match self {
            Self::Docker(env) => env.published_ports(),
            Self::Vm(env) => env.published_ports(),
        }
    }

    pub async fn start(&self) -> Result<(), EnvError> {
        match self {
            Self::Docker(env) => env.start().await.map_err(EnvError::from),
            Self::Vm(env) => env.start().await.map_err(EnvError::from),
        }
    }

    pub async fn restart(&self) -> Result<(), EnvError> {
        match self {
            Self::Docker(env) => env.restart().await.map_err(EnvError::from),
            Self::Vm(env) => env.restart().await.map_err(EnvError::from),
        }
    }

    pub async fn status(&self) -> Result<Status, EnvError> {
        match self {
            Self::Docker(env) => env.status().await.map_err(EnvError::from),
            Self::Vm(env) => env.status().await.map_err(EnvError::from),
        }
    }

    pub fn access_info(&self) -> AccessInfo {
        match self {
            Self::Docker(env) => env.access_info(),
            Self::Vm(env) => env.access_info(),
        }
    }

    pub async fn resources(&self) -> ResourceUsage {
        match self {
            Self::Docker(env) => env.resources().await,
            Self::Vm(env) => env.resources().await,
        }
    }

    pub async fn destroy(&self) {
        match self {
            Self::Docker(env) => env.destroy().await,
            Self::Vm(env) => env.destroy().await,
        }
    }
}

/// Aggregated usage of a cluster: the member breakdown plus the sum.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterResources {
    pub total: ResourceUsage,
    pub environments: BTreeMap<String, ResourceUsage>,
}

/// A set of environments sharing one isolated L2 network, managed as a
/// unit.
pub struct Cluster {
    db_id: i64,
    display_name: String,
    session_index: u32,
    network_name: String,
    container_network: String,
    environments: Vec<Environment>,
    hypervisor: Arc<dyn Hypervisor>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("db_id", &self.db_id)
            .field("display_name", &self.display_name)
            .field("session_index", &self.session_index)
            .field("network_name", &self.network_name)
            .field("container_network", &self.container_network)
            .field("environments", &self.environments)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Provision the cluster's network resources: the host bridge first,
    /// then the container network riding on it. A partial failure rolls
    /// back whatever was created.
    pub async fn create(
        hypervisor: Arc<dyn Hypervisor>,
        runtime: Arc<dyn ContainerRuntime>,
        db_id: i64,
        display_name: String,
        session_index: u32,
    ) -> Result<Self, ClusterError> {
        let network_name = netplan::bridge_name(session_index);
        let subnet = netplan::subnet(session_index)?;
        let gateway = netplan::gateway(session_index)?;
        let dhcp = netplan::dhcp_range(session_index)?;

        bridge::create(&*hypervisor, &network_name, gateway, dhcp)
            .await
            .map_err(ClusterError::Bridge)?;

        let container_network =
            match docker_network::create(&*runtime, &network_name, subnet, gateway).await {
                Ok(name) => name,
                Err(e) => {
                    bridge::remove(&*hypervisor, &network_name).await;
                    return Err(ClusterError::ContainerNetwork(e));
                }
            };

        info!(
            cluster = %display_name,
            network = %network_name,
            subnet = %subnet,
            "provisioned cluster network"
        );

        Ok(Self {
            db_id,
            display_name,
            session_index,
            network_name,
            container_network,
            environments: Vec::new(),
            hypervisor,
            runtime,
        })
    }

    pub fn db_id(&self) -> i64 {
        self.db_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn session_index(&self) -> u32 {
        self.session_index
    }

    /// Bridge (and libvirt network) name shared by every member.
    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Container-network name for container members.
    pub fn container_network(&self) -> &str {
        &self.container_network
    }

    pub fn environments(&self) -> &[Environment] {
        &self.environments
    }

    pub fn add_environment(&mut self, env: Environment) {
        self.environments.push(env);
    }

    /// Every published port held by every member, for pool release.
    pub fn published_ports(&self) -> Vec<u16> {
        self.environments
            .iter()
            .flat_map(|env| env.published_ports().iter().copied())
            .collect()
    }

    /// Start members in insertion order. A failure is surfaced with the
    /// partial cluster left intact, so the caller can still destroy it.
    pub async fn start(&self) -> Result<(), EnvError> {
        for env in &self.environments {
            env.start().await?;
        }
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), EnvError> {
        for env in &self.environments {
            env.restart().await?;
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<BTreeMap<String, Status>, EnvError> {
        let mut statuses = BTreeMap::new();
        for env in &self.environments {
            statuses.insert(env.display_name().to_string(), env.status().await?);
        }
        Ok(statuses)
    }

    pub async fn is_ready(&self) -> Result<bool, EnvError> {
        for env in &self.environments {
            if env.status().await? != Status::Running {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn access_info(&self) -> BTreeMap<String, AccessInfo> {
        self.environments
            .iter()
            .map(|env| (env.display_name().to_string(), env.access_info()))
            .collect()
    }

    pub async fn resources(&self) -> ClusterResources {
        let mut resources = ClusterResources::default();
        for env in &self.environments {
            let usage = env.resources().await;
            resources.total.accumulate(&usage);
            resources
                .environments
                .insert(env.display_name().to_string(), usage);
        }
        resources
    }

    /// Tear everything down: members first (best-effort each), then the
    /// container network, then the host bridge. The network teardown
    /// always runs, whatever the members did.
    pub async fn destroy(&self) {
        for env in &self.environments {
            env.destroy().await;
        }
        docker_network::remove(&*self.runtime, &self.container_network).await;
        bridge::remove(&*self.hypervisor, &self.network_name).await;
        info!(cluster = %self.display_name, "destroyed cluster");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap as Map;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ipnet::Ipv4Net;

    use crate::docker_env::DockerEnvConfig;
    use crate::hypervisor::{DomainMemoryStats, DomainState, InterfaceStats};
    use crate::runtime::{ContainerSpec, ContainerStats, DockerEnvError};

    #[derive(Default)]
    struct FakeHypervisor {
        networks: Mutex<Vec<String>>,
        removed_networks: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Hypervisor for FakeHypervisor {
        async fn define_domain(&self, _xml: &str) -> crate::hypervisor::Result<()> {
            Ok(())
        }
        async fn start_domain(&self, _name: &str) -> crate::hypervisor::Result<()> {
            Ok(())
        }
        async fn reboot_domain(&self, _name: &str) -> crate::hypervisor::Result<()> {
            Ok(())
        }
        async fn destroy_domain(&self, _name: &str) {}
        async fn undefine_domain(&self, _name: &str) {}
        async fn domain_state(&self, _name: &str) -> crate::hypervisor::Result<DomainState> {
            Ok(DomainState::Running)
        }
        async fn domain_xml(&self, _name: &str) -> crate::hypervisor::Result<String> {
            Ok(String::new())
        }
        async fn domain_memory_stats(
            &self,
            _name: &str,
        ) -> crate::hypervisor::Result<DomainMemoryStats> {
            Ok(DomainMemoryStats::default())
        }
        async fn domain_used_memory_kib(&self, _name: &str) -> crate::hypervisor::Result<u64> {
            Ok(0)
        }
        async fn interface_stats(
            &self,
            _name: &str,
            _device: &str,
        ) -> crate::hypervisor::Result<InterfaceStats> {
            Ok(InterfaceStats::default())
        }
        async fn define_network(&self, xml: &str) -> crate::hypervisor::Result<()> {
            self.networks.lock().unwrap().push(xml.to_string());
            Ok(())
        }
        async fn start_network(&self, _name: &str) -> crate::hypervisor::Result<()> {
            Ok(())
        }
        async fn autostart_network(&self, _name: &str) -> crate::hypervisor::Result<()> {
            Ok(())
        }
        async fn destroy_network(&self, _name: &str) {}
        async fn undefine_network(&self, name: &str) {
            self.removed_networks.lock().unwrap().push(name.to_string());
        }
    }

    #[derive(Default)]
    struct FakeRuntime {
        networks: Mutex<Vec<String>>,
        removed_networks: Mutex<Vec<String>>,
        containers: Mutex<Map<String, String>>,
        fail_create_network: bool,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create_network(
            &self,
            name: &str,
            _bridge: &str,
            _subnet: Ipv4Net,
            _gateway: Ipv4Addr,
        ) -> Result<(), DockerEnvError> {
            if self.fail_create_network {
                return Err(DockerEnvError::Api("network create refused".into()));
            }
            self.networks.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn remove_network(&self, name: &str) -> Result<(), DockerEnvError> {
            self.removed_networks.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn run_container(&self, spec: ContainerSpec<'_>) -> Result<(), DockerEnvError> {
            self.containers
                .lock()
                .unwrap()
                .insert(spec.name.to_string(), "running".to_string());
            Ok(())
        }

        async fn restart_container(&self, _name: &str) -> Result<(), DockerEnvError> {
            Ok(())
        }

        async fn remove_container(&self, name: &str) -> Result<(), DockerEnvError> {
            self.containers.lock().unwrap().remove(name);
            Ok(())
        }

        async fn container_state(&self, name: &str) -> Result<String, DockerEnvError> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_default())
        }

        async fn container_ip(
            &self,
            _name: &str,
            _network: &str,
        ) -> Result<Option<String>, DockerEnvError> {
            Ok(Some("10.0.7.101".to_string()))
        }

        async fn container_stats(&self, _name: &str) -> Result<ContainerStats, DockerEnvError> {
            Ok(ContainerStats {
                memory_usage: 500,
                memory_cache: 100,
                rx_bytes: 7,
                tx_bytes: 9,
            })
        }
    }

    fn docker_env(runtime: &Arc<FakeRuntime>, name: &str, port: u16) -> Environment {
        Environment::Docker(
            DockerEnvironment::new(
                Arc::clone(runtime) as Arc<dyn ContainerRuntime>,
                DockerEnvConfig {
                    name: format!("7-{name}"),
                    display_name: name.to_string(),
                    image: "echo:1".into(),
                    internal_ports: vec![80],
                    published_ports: vec![port],
                    variables: Map::new(),
                    access_template: "http://{{ip}}:{{80}}".into(),
                    network_name: "venvbr7-docker".into(),
                },
            )
            .unwrap(),
        )
    }

    async fn fixture_cluster(
        hypervisor: &Arc<FakeHypervisor>,
        runtime: &Arc<FakeRuntime>,
    ) -> Cluster {
        Cluster::create(
            Arc::clone(hypervisor) as Arc<dyn Hypervisor>,
            Arc::clone(runtime) as Arc<dyn ContainerRuntime>,
            1,
            "7-demo".into(),
            7,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_provisions_bridge_and_container_network() {
        let hypervisor = Arc::new(FakeHypervisor::default());
        let runtime = Arc::new(FakeRuntime::default());
        let cluster = fixture_cluster(&hypervisor, &runtime).await;

        assert_eq!(cluster.network_name(), "venvbr7");
        assert_eq!(cluster.container_network(), "venvbr7-docker");

        let defined = hypervisor.networks.lock().unwrap();
        assert_eq!(defined.len(), 1);
        assert!(defined[0].contains("<name>venvbr7</name>"));
        assert!(defined[0].contains("10.0.7.1"));
        assert_eq!(
            runtime.networks.lock().unwrap().as_slice(),
            ["venvbr7-docker"]
        );
    }

    #[tokio::test]
    async fn create_rolls_back_bridge_when_container_network_fails() {
        let hypervisor = Arc::new(FakeHypervisor::default());
        let runtime = Arc::new(FakeRuntime {
            fail_create_network: true,
            ..Default::default()
        });

        let err = Cluster::create(
            Arc::clone(&hypervisor) as Arc<dyn Hypervisor>,
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            1,
            "7-demo".into(),
            7,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ClusterError::ContainerNetwork(_)));
        assert_eq!(
            hypervisor.removed_networks.lock().unwrap().as_slice(),
            ["venvbr7"]
        );
    }

    #[tokio::test]
    async fn start_and_status_fan_out_in_order() {
        let hypervisor = Arc::new(FakeHypervisor::default());
        let runtime = Arc::new(FakeRuntime::default());
        let mut cluster = fixture_cluster(&hypervisor, &runtime).await;
        cluster.add_environment(docker_env(&runtime, "web", 20000));
        cluster.add_environment(docker_env(&runtime, "db", 20001));

        cluster.start().await.unwrap();
        assert!(cluster.is_ready().await.unwrap());

        let statuses = cluster.status().await.unwrap();
        assert_eq!(statuses["web"], Status::Running);
        assert_eq!(statuses["db"], Status::Running);

        assert_eq!(cluster.published_ports(), vec![20000, 20001]);
    }

    #[tokio::test]
    async fn resources_sum_members() {
        let hypervisor = Arc::new(FakeHypervisor::default());
        let runtime = Arc::new(FakeRuntime::default());
        let mut cluster = fixture_cluster(&hypervisor, &runtime).await;
        cluster.add_environment(docker_env(&runtime, "web", 20000));
        cluster.add_environment(docker_env(&runtime, "db", 20001));
        cluster.start().await.unwrap();

        let resources = cluster.resources().await;
        assert_eq!(resources.total.memory, 800);
        assert_eq!(resources.total.network.rx, 14);
        assert_eq!(resources.environments.len(), 2);
    }

    #[tokio::test]
    async fn destroy_removes_members_then_networks() {
        let hypervisor = Arc::new(FakeHypervisor::default());
        let runtime = Arc::new(FakeRuntime::default());
        let mut cluster = fixture_cluster(&hypervisor, &runtime).await;
        cluster.add_environment(docker_env(&runtime, "web", 20000));
        cluster.start().await.unwrap();

        cluster.destroy().await;

        assert!(runtime.containers.lock().unwrap().is_empty());
        assert_eq!(
            runtime.removed_networks.lock().unwrap().as_slice(),
            ["venvbr7-docker"]
        );
        assert_eq!(
            hypervisor.removed_networks.lock().unwrap().as_slice(),
            ["venvbr7"]
        );
    }
}
