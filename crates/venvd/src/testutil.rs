//! Shared fakes for service and registry tests: every seam trait gets an
//! in-memory implementation that records the calls the real one would
//! turn into host side effects.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cluster::{
    Cluster, ContainerRuntime, ContainerSpec, ContainerStats, DockerEnvError, DomainMemoryStats,
    DomainState, ForwardError, ForwardHandle, Hypervisor, HypervisorError, InterfaceStats,
    Neighbors, OverlayError, OverlayManager, PortForwarder, VmStack,
};
use ipnet::Ipv4Net;

use crate::catalog::{Catalog, ClusterDef, DockerDef, EnvKindDef, EnvironmentDef, VmDef};
use crate::host::{HostProbe, HostStats};
use crate::ports::PortPool;
use crate::service::{Service, ServiceConfig};

const VM_MAC: &str = "52:54:00:00:00:07";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Container runtime
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeRuntime {
    networks: Mutex<Vec<String>>,
    removed_networks: Mutex<Vec<String>>,
    containers: Mutex<HashMap<String, BTreeMap<String, String>>>,
    fail_next_run: AtomicBool,
}

impl FakeRuntime {
    pub fn fail_next_run(&self) {
        self.fail_next_run.store(true, Ordering::SeqCst);
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.containers).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn container_env(&self, name: &str, key: &str) -> Option<String> {
        lock(&self.containers)
            .get(name)
            .and_then(|env| env.get(key).cloned())
    }

    pub fn networks(&self) -> Vec<String> {
        lock(&self.networks).clone()
    }

    pub fn removed_networks(&self) -> Vec<String> {
        lock(&self.removed_networks).clone()
    }
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
        lock(&self.networks).push(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), DockerEnvError> {
        lock(&self.removed_networks).push(name.to_string());
        Ok(())
    }

    async fn run_container(&self, spec: ContainerSpec<'_>) -> Result<(), DockerEnvError> {
        if self.fail_next_run.swap(false, Ordering::SeqCst) {
            return Err(DockerEnvError::ImageNotFound(spec.image.to_string()));
        }
        lock(&self.containers).insert(spec.name.to_string(), spec.variables.clone());
        Ok(())
    }

    async fn restart_container(&self, name: &str) -> Result<(), DockerEnvError> {
        if !lock(&self.containers).contains_key(name) {
            return Err(DockerEnvError::Api(format!("no such container: {name}")));
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), DockerEnvError> {
        lock(&self.containers).remove(name);
        Ok(())
    }

    async fn container_state(&self, name: &str) -> Result<String, DockerEnvError> {
        if lock(&self.containers).contains_key(name) {
            Ok("running".to_string())
        } else {
            Err(DockerEnvError::Api(format!("no such container: {name}")))
        }
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

// ---------------------------------------------------------------------------
// Hypervisor
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeHypervisor {
    /// domain name -> network it is attached to
    domains: Mutex<HashMap<String, String>>,
    undefined_domains: Mutex<Vec<String>>,
    defined_networks: Mutex<Vec<String>>,
    removed_networks: Mutex<Vec<String>>,
}

impl FakeHypervisor {
    pub fn defined_networks(&self) -> Vec<String> {
        lock(&self.defined_networks).clone()
    }

    pub fn removed_networks(&self) -> Vec<String> {
        lock(&self.removed_networks).clone()
    }

    pub fn undefined_domains(&self) -> Vec<String> {
        lock(&self.undefined_domains).clone()
    }
}

fn xml_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let rest = xml.split(&open).nth(1)?;
    rest.split(&close).next().map(String::from)
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn define_domain(&self, xml: &str) -> Result<(), HypervisorError> {
        let name = xml_tag(xml, "name").unwrap_or_default();
        let network = xml_tag(xml, "net").unwrap_or_default();
        lock(&self.domains).insert(name, network);
        Ok(())
    }

    async fn start_domain(&self, _name: &str) -> Result<(), HypervisorError> {
        Ok(())
    }

    async fn reboot_domain(&self, _name: &str) -> Result<(), HypervisorError> {
        Ok(())
    }

    async fn destroy_domain(&self, _name: &str) {}

    async fn undefine_domain(&self, name: &str) {
        lock(&self.domains).remove(name);
        lock(&self.undefined_domains).push(name.to_string());
    }

    async fn domain_state(&self, _name: &str) -> Result<DomainState, HypervisorError> {
        Ok(DomainState::Running)
    }

    async fn domain_xml(&self, name: &str) -> Result<String, HypervisorError> {
        let network = lock(&self.domains).get(name).cloned().unwrap_or_default();
        Ok(format!(
            "<domain><name>{name}</name><devices><interface type='network'>\
             <mac address='{VM_MAC}'/><source network='{network}' bridge='{network}'/>\
             <target dev='vnet7'/></interface></devices></domain>"
        ))
    }

    async fn domain_memory_stats(&self, _name: &str) -> Result<DomainMemoryStats, HypervisorError> {
        Ok(DomainMemoryStats {
            rss_kib: Some(2048),
            actual_kib: None,
        })
    }

    async fn domain_used_memory_kib(&self, _name: &str) -> Result<u64, HypervisorError> {
        Ok(1024)
    }

    async fn interface_stats(
        &self,
        _name: &str,
        _device: &str,
    ) -> Result<InterfaceStats, HypervisorError> {
        Ok(InterfaceStats {
            rx_bytes: 10,
            tx_bytes: 20,
        })
    }

    async fn define_network(&self, xml: &str) -> Result<(), HypervisorError> {
        lock(&self.defined_networks).push(xml.to_string());
        Ok(())
    }

    async fn start_network(&self, _name: &str) -> Result<(), HypervisorError> {
        Ok(())
    }

    async fn autostart_network(&self, _name: &str) -> Result<(), HypervisorError> {
        Ok(())
    }

    async fn destroy_network(&self, _name: &str) {}

    async fn undefine_network(&self, name: &str) {
        lock(&self.removed_networks).push(name.to_string());
    }
}

// ---------------------------------------------------------------------------
// Overlays, forwarders, neighbors
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeOverlays {
    existing: Mutex<HashSet<PathBuf>>,
}

impl FakeOverlays {
    pub fn is_empty(&self) -> bool {
        lock(&self.existing).is_empty()
    }
}

#[async_trait]
impl OverlayManager for FakeOverlays {
    async fn create(&self, _base: &Path, overlay: &Path) -> Result<(), OverlayError> {
        if !lock(&self.existing).insert(overlay.to_path_buf()) {
            return Err(OverlayError::AlreadyExists(overlay.to_path_buf()));
        }
        Ok(())
    }

    async fn remove(&self, overlay: &Path) -> bool {
        lock(&self.existing).remove(overlay);
        true
    }
}

pub struct FakeHandle {
    terminated: Arc<AtomicUsize>,
}

#[async_trait]
impl ForwardHandle for FakeHandle {
    async fn terminate(&mut self) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeForwarder {
    forwards: AtomicUsize,
    terminated: Arc<AtomicUsize>,
}

impl FakeForwarder {
    pub fn forward_count(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }

    pub fn terminated_count(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortForwarder for FakeForwarder {
    async fn forward(
        &self,
        _dest_ip: &str,
        _dest_port: u16,
        _host_port: u16,
    ) -> Result<Box<dyn ForwardHandle>, ForwardError> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeHandle {
            terminated: Arc::clone(&self.terminated),
        }))
    }
}

#[derive(Default)]
pub struct FakeNeighbors {
    ip: Mutex<Option<String>>,
}

impl FakeNeighbors {
    pub fn set_ip(&self, ip: &str) {
        *lock(&self.ip) = Some(ip.to_string());
    }
}

#[async_trait]
impl Neighbors for FakeNeighbors {
    async fn find_by_mac(&self, mac: &str) -> Option<String> {
        if mac == VM_MAC {
            lock(&self.ip).clone()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog and host probe
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeCatalog {
    clusters: Mutex<HashMap<i64, ClusterDef>>,
}

impl FakeCatalog {
    pub fn insert(&self, def: ClusterDef) {
        lock(&self.clusters).insert(def.id, def);
    }

    pub fn remove(&self, id: i64) {
        lock(&self.clusters).remove(&id);
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn cluster(&self, id: i64) -> Option<ClusterDef> {
        lock(&self.clusters).get(&id).cloned()
    }
}

pub struct FakeProbe;

#[async_trait]
impl HostProbe for FakeProbe {
    async fn sample(&self) -> HostStats {
        HostStats {
            cpu_percent: 12.5,
            memory_percent: 42.0,
            memory_total: 8 * 1024 * 1024 * 1024,
            network: environment::NetworkUsage { rx: 100, tx: 200 },
        }
    }
}

// ---------------------------------------------------------------------------
// Definitions and fixture
// ---------------------------------------------------------------------------

/// One-container cluster definition (`web`, image `echo:1`, port 8080).
pub fn docker_cluster_def(id: i64) -> ClusterDef {
    ClusterDef {
        id,
        name: "web-stack".into(),
        environments: vec![EnvironmentDef {
            id: 10,
            name: "web".into(),
            ports: vec![8080],
            access_info: "http://{{ip}}:{{8080}}".into(),
            kind: EnvKindDef::Docker(DockerDef {
                image: "echo:1".into(),
            }),
        }],
    }
}

/// One-VM cluster definition (`win`, rdp on 3389).
pub fn vm_cluster_def(id: i64) -> ClusterDef {
    ClusterDef {
        id,
        name: "vm-stack".into(),
        environments: vec![EnvironmentDef {
            id: 20,
            name: "win".into(),
            ports: vec![3389],
            access_info: "rdp://{{ip}}:{{3389}}".into(),
            kind: EnvKindDef::Vm(VmDef {
                template: "<domain><name>{{VM_NAME}}</name><uuid>{{VM_UUID}}</uuid>\
                           <disk>{{DISK_IMAGE}}</disk><net>{{NETWORK_NAME}}</net></domain>"
                    .into(),
                base_image_path: "/srv/bases/win7.qcow2".into(),
            }),
        }],
    }
}

/// All seam fakes, pre-wired for building a [`Service`].
pub struct Fixture {
    pub catalog: Arc<FakeCatalog>,
    pub runtime: Arc<FakeRuntime>,
    pub hypervisor: Arc<FakeHypervisor>,
    pub overlays: Arc<FakeOverlays>,
    pub forwarder: Arc<FakeForwarder>,
    pub neighbors: Arc<FakeNeighbors>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            catalog: Arc::new(FakeCatalog::default()),
            runtime: Arc::new(FakeRuntime::default()),
            hypervisor: Arc::new(FakeHypervisor::default()),
            overlays: Arc::new(FakeOverlays::default()),
            forwarder: Arc::new(FakeForwarder::default()),
            neighbors: Arc::new(FakeNeighbors::default()),
        }
    }

    pub fn vm_stack(&self) -> VmStack {
        VmStack {
            hypervisor: Arc::clone(&self.hypervisor) as Arc<dyn Hypervisor>,
            overlays: Arc::clone(&self.overlays) as Arc<dyn OverlayManager>,
            forwarder: Arc::clone(&self.forwarder) as Arc<dyn PortForwarder>,
            neighbors: Arc::clone(&self.neighbors) as Arc<dyn Neighbors>,
        }
    }

    pub fn service(&self, port_range: Range<u16>) -> Arc<Service> {
        self.service_with(port_range, |_| {})
    }

    pub fn service_with(
        &self,
        port_range: Range<u16>,
        tune: impl FnOnce(&mut ServiceConfig),
    ) -> Arc<Service> {
        let mut config = ServiceConfig {
            ttl: Duration::from_secs(60),
            ttl_poll_interval: Duration::from_secs(60),
            ttl_extend: Duration::from_secs(30),
            ttl_allow_extend_after: Duration::ZERO,
            boot_poll_interval: Duration::from_secs(1),
            boot_timeout: Duration::from_secs(30),
            overlays_dir: PathBuf::from("/overlays"),
            base_images_dir: PathBuf::from("/images"),
        };
        tune(&mut config);

        Service::new(
            config,
            Arc::clone(&self.catalog) as Arc<dyn Catalog>,
            PortPool::new(port_range),
            Arc::clone(&self.runtime) as Arc<dyn ContainerRuntime>,
            self.vm_stack(),
            Arc::new(FakeProbe),
        )
    }

    /// A bare cluster over the fixture's fakes, for registry tests.
    pub async fn cluster(&self, session_index: u32) -> Arc<Cluster> {
        Arc::new(
            Cluster::create(
                Arc::clone(&self.hypervisor) as Arc<dyn Hypervisor>,
                Arc::clone(&self.runtime) as Arc<dyn ContainerRuntime>,
                1,
                format!("{session_index}-test"),
                session_index,
            )
            .await
            .unwrap(),
        )
    }
}
