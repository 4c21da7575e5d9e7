use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::{info, warn};

use crate::netplan;
use crate::runtime::{ContainerRuntime, DockerEnvError};

/// Create the container-runtime network riding on a host bridge, so
/// containers and VMs share one L2. Returns the network name, which is
/// the handle for removal.
pub async fn create(
    runtime: &dyn ContainerRuntime,
    bridge: &str,
    subnet: Ipv4Net,
    gateway: Ipv4Addr,
) -> Result<String, DockerEnvError> {
    let name = netplan::container_network_name(bridge);
    runtime.create_network(&name, bridge, subnet, gateway).await?;
    info!(network = %name, bridge = %bridge, subnet = %subnet, "created container network");
    Ok(name)
}

/// Remove the container-runtime network object. Failures are logged;
/// the kernel bridge teardown that follows does not depend on this.
pub async fn remove(runtime: &dyn ContainerRuntime, name: &str) {
    match runtime.remove_network(name).await {
        Ok(()) => info!(network = %name, "removed container network"),
        Err(e) => warn!(network = %name, error = %e, "failed to remove container network"),
    }
}
