use crate::hypervisor::HypervisorError;
use crate::netplan::PlanError;
use crate::runtime::DockerEnvError;
use crate::vm_env::VmEnvError;

/// Failure of a single environment operation, either driver.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("invalid port mapping for {name}: {detail}")]
    PortMapping { name: String, detail: String },

    #[error(transparent)]
    Docker(#[from] DockerEnvError),

    #[error(transparent)]
    Vm(#[from] VmEnvError),
}

/// Failure while provisioning or operating a cluster.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("bridge provisioning failed: {0}")]
    Bridge(#[source] HypervisorError),

    #[error("container network provisioning failed: {0}")]
    ContainerNetwork(#[source] DockerEnvError),

    #[error(transparent)]
    Env(#[from] EnvError),
}
