use std::net::Ipv4Addr;

use tracing::info;

use crate::hypervisor::{Hypervisor, HypervisorError};

/// Render the hypervisor network document for one cluster bridge: a NAT
/// forwarded network whose bridge device carries the cluster's L2, with
/// built-in DHCP over the planned range.
fn network_xml(name: &str, gateway: Ipv4Addr, dhcp: (Ipv4Addr, Ipv4Addr)) -> String {
    let (dhcp_start, dhcp_end) = dhcp;
    format!(
        "<network>\n  \
           <name>{name}</name>\n  \
           <forward mode='nat'/>\n  \
           <bridge name='{name}' stp='on' delay='0'/>\n  \
           <ip address='{gateway}' netmask='255.255.255.0'>\n    \
             <dhcp>\n      \
               <range start='{dhcp_start}' end='{dhcp_end}'/>\n    \
             </dhcp>\n  \
           </ip>\n\
         </network>\n"
    )
}

/// Define, start and autostart the host bridge network.
///
/// Fails fast on define or start; a half-created network is cleaned up
/// by [`remove`], which the caller runs on any downstream failure.
pub async fn create(
    hypervisor: &dyn Hypervisor,
    name: &str,
    gateway: Ipv4Addr,
    dhcp: (Ipv4Addr, Ipv4Addr),
) -> Result<(), HypervisorError> {
    let xml = network_xml(name, gateway, dhcp);
    hypervisor.define_network(&xml).await?;
    hypervisor.start_network(name).await?;
    hypervisor.autostart_network(name).await?;
    info!(bridge = %name, gateway = %gateway, "created host bridge network");
    Ok(())
}

/// Destroy and undefine the bridge network. Both steps are best-effort
/// so repeated cleanup is safe.
pub async fn remove(hypervisor: &dyn Hypervisor, name: &str) {
    hypervisor.destroy_network(name).await;
    hypervisor.undefine_network(name).await;
    info!(bridge = %name, "removed host bridge network");
}
