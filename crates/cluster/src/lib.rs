mod bridge;
mod cluster;
mod command;
mod docker_env;
mod docker_network;
mod domxml;
mod error;
mod forward;
mod hypervisor;
mod neigh;
mod netplan;
mod overlay;
mod runtime;
mod vm_env;

pub use cluster::{Cluster, ClusterResources, Environment};
pub use command::CommandError;
pub use docker_env::{DockerEnvConfig, DockerEnvironment};
pub use error::{ClusterError, EnvError};
pub use forward::{ForwardError, ForwardHandle, PortForwarder, Socat};
pub use hypervisor::{
    DomainMemoryStats, DomainState, Hypervisor, HypervisorError, InterfaceStats, Virsh,
};
pub use neigh::{IpNeigh, Neighbors};
pub use netplan::{MAX_CLUSTERS, PlanError};
pub use overlay::{OverlayError, OverlayManager, QemuImg, overlay_path};
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerStats, DockerApi, DockerEnvError};
pub use vm_env::{VmEnvConfig, VmEnvError, VmEnvironment, VmStack};
