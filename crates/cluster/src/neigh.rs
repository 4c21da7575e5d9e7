use async_trait::async_trait;
use tracing::trace;

use crate::command::exec;

/// Host neighbor-table lookup used for VM IP discovery.
///
/// DHCP leases handed out on a cluster bridge surface in the host ARP
/// table once the guest talks; the first row carrying the guest's MAC
/// yields its IP.
#[async_trait]
pub trait Neighbors: Send + Sync {
    /// IP of the neighbor with the given MAC, if present.
    async fn find_by_mac(&self, mac: &str) -> Option<String>;
}

/// Production lookup parsing `ip neigh` output.
pub struct IpNeigh;

#[async_trait]
impl Neighbors for IpNeigh {
    async fn find_by_mac(&self, mac: &str) -> Option<String> {
        let output = match exec("ip", &["neigh"]).await {
            Ok(output) => output,
            Err(e) => {
                trace!(error = %e, "neighbor table read failed");
                return None;
            }
        };
        find_in_table(&output, mac)
    }
}

fn find_in_table(table: &str, mac: &str) -> Option<String> {
    let mac = mac.to_lowercase();
    table
        .lines()
        .find(|line| line.to_lowercase().contains(&mac))
        .and_then(|line| line.split_whitespace().next())
        .map(String::from)
}
