use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// Highest session index the service accepts.
pub const MAX_CLUSTERS: u32 = 62_976;

/// Highest index the address plan itself can express (`10.255.255.0/24`).
const MAX_PLAN_INDEX: u32 = 65_535;

/// First and last host id handed out by DHCP.
const DHCP_FIRST_HOST: u8 = 100;
const DHCP_LAST_HOST: u8 = 200;

const SUBNET_PREFIX_LEN: u8 = 24;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("cluster index {0} exceeds the 10.0.0.0/8 address plan")]
    IndexOutOfRange(u32),

    #[error("host id {0} must be between 2 and 254")]
    HostIdOutOfRange(u8),
}

/// Second and third subnet octets for a cluster index.
fn octets(index: u32) -> Result<(u8, u8), PlanError> {
    if index > MAX_PLAN_INDEX {
        return Err(PlanError::IndexOutOfRange(index));
    }
    Ok(((index / 256) as u8, (index % 256) as u8))
}

/// The /24 owned by a cluster: `10.(i/256).(i%256).0/24`.
///
/// Derivation is pure and collision-free across indices, so concurrent
/// cluster builds never need a shared address registry.
pub fn subnet(index: u32) -> Result<Ipv4Net, PlanError> {
    let (x, y) = octets(index)?;
    Ipv4Net::new(Ipv4Addr::new(10, x, y, 0), SUBNET_PREFIX_LEN)
        .map_err(|_| PlanError::IndexOutOfRange(index))
}

/// Gateway address of the cluster subnet (`.1`).
pub fn gateway(index: u32) -> Result<Ipv4Addr, PlanError> {
    let (x, y) = octets(index)?;
    Ok(Ipv4Addr::new(10, x, y, 1))
}

/// A host address inside the cluster subnet. `.1` is the gateway and
/// `.255` the broadcast address, so host ids are restricted to 2..=254.
pub fn host(index: u32, host_id: u8) -> Result<Ipv4Addr, PlanError> {
    let (x, y) = octets(index)?;
    if !(2..=254).contains(&host_id) {
        return Err(PlanError::HostIdOutOfRange(host_id));
    }
    Ok(Ipv4Addr::new(10, x, y, host_id))
}

/// Inclusive DHCP range assigned to environments (`.100` .. `.200`).
pub fn dhcp_range(index: u32) -> Result<(Ipv4Addr, Ipv4Addr), PlanError> {
    Ok((host(index, DHCP_FIRST_HOST)?, host(index, DHCP_LAST_HOST)?))
}

/// Name of the host bridge (and of the libvirt network) for a cluster.
pub fn bridge_name(index: u32) -> String {
    format!("venvbr{index}")
}

/// Name of the container-runtime network riding on a bridge.
pub fn container_network_name(bridge: &str) -> String {
    format!("{bridge}-docker")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_index_zero() {
        assert_eq!(subnet(0).unwrap().to_string(), "10.0.0.0/24");
        assert_eq!(gateway(0).unwrap().to_string(), "10.0.0.1");
        assert_eq!(host(0, 100).unwrap().to_string(), "10.0.0.100");
    }

    #[test]
    fn subnet_index_257_crosses_octet_boundary() {
        assert_eq!(subnet(257).unwrap().to_string(), "10.1.1.0/24");
        assert_eq!(gateway(257).unwrap().to_string(), "10.1.1.1");
        assert_eq!(bridge_name(257), "venvbr257");
    }

    #[test]
    fn subnet_max_plan_index_is_valid() {
        assert_eq!(subnet(65_535).unwrap().to_string(), "10.255.255.0/24");
    }

    #[test]
    fn subnet_beyond_plan_is_rejected() {
        assert_eq!(subnet(65_536), Err(PlanError::IndexOutOfRange(65_536)));
        assert_eq!(gateway(70_000), Err(PlanError::IndexOutOfRange(70_000)));
    }

    #[test]
    fn host_id_bounds() {
        assert!(host(0, 1).is_err());
        assert!(host(0, 255).is_err());
        assert_eq!(host(0, 2).unwrap().to_string(), "10.0.0.2");
        assert_eq!(host(0, 254).unwrap().to_string(), "10.0.0.254");
    }

    #[test]
    fn gateway_is_inside_subnet_but_outside_dhcp_range() {
        for index in [0, 1, 255, 256, 257, 4095, 65_535] {
            let net = subnet(index).unwrap();
            let gw = gateway(index).unwrap();
            let (start, end) = dhcp_range(index).unwrap();
            assert!(net.contains(&gw), "gateway outside subnet for {index}");
            assert!(gw < start, "gateway inside dhcp range for {index}");
            assert!(net.contains(&start) && net.contains(&end));
            assert!(start < end);
        }
    }

    #[test]
    fn subnets_do_not_overlap() {
        let mut seen = std::collections::HashSet::new();
        for index in (0..=65_535).step_by(127) {
            let net = subnet(index).unwrap();
            assert!(seen.insert(net), "duplicate subnet for index {index}");
        }
    }

    #[test]
    fn max_clusters_fits_the_plan() {
        assert!(MAX_CLUSTERS <= MAX_PLAN_INDEX + 1);
        assert!(subnet(MAX_CLUSTERS - 1).is_ok());
    }

    #[test]
    fn container_network_name_appends_suffix() {
        assert_eq!(container_network_name("venvbr7"), "venvbr7-docker");
    }
}
