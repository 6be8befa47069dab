use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The router interface reserved for the management network.
pub const MANAGEMENT_INTERFACE: &str = "eth0";

/// Host offset of the first DHCP lease (and first auto-assigned VM address).
pub const DHCP_RANGE_START_OFFSET: u32 = 10;

/// Host offset of the last DHCP lease.
pub const DHCP_RANGE_END_OFFSET: u32 = 250;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Iterates the usable host addresses of `subnet`, skipping the network and broadcast addresses
/// for prefixes shorter than /31.
pub fn host_addresses(subnet: Ipv4Network) -> impl Iterator<Item = Ipv4Addr> {
    let network = subnet.network();
    let broadcast = subnet.broadcast();
    let keep_edges = subnet.prefix() >= 31;
    subnet
        .iter()
        .filter(move |ip| keep_edges || (*ip != network && *ip != broadcast))
}

/// The DHCP lease range of a subnet: `.10` to `.250` for a /24. Larger subnets use the same
/// offsets; smaller ones end at the last usable host. Returns `None` when the subnet cannot
/// hold the first offset.
pub fn dhcp_range(subnet: Ipv4Network) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let last_usable = last_usable_host(subnet)?;
    let start = subnet.nth(DHCP_RANGE_START_OFFSET)?;
    if u32::from(start) > u32::from(last_usable) {
        return None;
    }

    let end = match subnet.nth(DHCP_RANGE_END_OFFSET) {
        Some(end) if u32::from(end) <= u32::from(last_usable) => end,
        _ => last_usable,
    };

    Some((start, end))
}

/// The last usable host of a subnet.
pub fn last_usable_host(subnet: Ipv4Network) -> Option<Ipv4Addr> {
    host_addresses(subnet).last()
}

/// The address Docker's own bridge takes on a range network. The router owns the range gateway,
/// so the bridge gets the last usable host unless that collides with the router.
pub fn docker_bridge_gateway(subnet: Ipv4Network, router_gateway: Ipv4Addr) -> Option<Ipv4Addr> {
    let mut hosts: Vec<Ipv4Addr> = host_addresses(subnet).collect();
    hosts.reverse();
    hosts.into_iter().find(|ip| *ip != router_gateway)
}

/// The router interface for the `index`-th range network (`eth1`, `eth2`, ...).
pub fn router_interface_name(index: u32) -> String {
    format!("eth{index}")
}

/// Parses the index out of a router interface name.
pub fn router_interface_index(interface: &str) -> Option<u32> {
    interface
        .strip_prefix("eth")
        .and_then(|n| n.parse::<u32>().ok())
        .filter(|n| *n > 0)
}

/// The NAT rule number used for the network on router interface `index`.
pub fn nat_rule_number(index: u32) -> u32 {
    index * 10
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dhcp_range_for_slash_24() {
        let subnet: Ipv4Network = "10.0.1.0/24".parse().unwrap();
        assert_eq!(
            dhcp_range(subnet),
            Some((Ipv4Addr::new(10, 0, 1, 10), Ipv4Addr::new(10, 0, 1, 250)))
        );
    }

    #[test]
    fn test_dhcp_range_small_subnets() {
        let subnet: Ipv4Network = "10.0.1.0/28".parse().unwrap();
        assert_eq!(
            dhcp_range(subnet),
            Some((Ipv4Addr::new(10, 0, 1, 10), Ipv4Addr::new(10, 0, 1, 14)))
        );

        let tiny: Ipv4Network = "10.0.1.0/29".parse().unwrap();
        assert_eq!(dhcp_range(tiny), None);
    }

    #[test]
    fn test_docker_bridge_gateway_avoids_router() {
        let subnet: Ipv4Network = "10.0.1.0/24".parse().unwrap();
        assert_eq!(
            docker_bridge_gateway(subnet, Ipv4Addr::new(10, 0, 1, 1)),
            Some(Ipv4Addr::new(10, 0, 1, 254))
        );
        assert_eq!(
            docker_bridge_gateway(subnet, Ipv4Addr::new(10, 0, 1, 254)),
            Some(Ipv4Addr::new(10, 0, 1, 253))
        );
    }

    #[test]
    fn test_router_interface_names() {
        assert_eq!(router_interface_name(3), "eth3");
        assert_eq!(router_interface_index("eth3"), Some(3));
        assert_eq!(router_interface_index("eth0"), None);
        assert_eq!(router_interface_index("br-1"), None);
        assert_eq!(nat_rule_number(2), 20);
    }
}
