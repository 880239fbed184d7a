use pnet::datalink;
use pnet::ipnetwork::IpNetwork;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub addrs: Vec<IpAddr>,
    pub up: bool,
    pub loopback: bool,
}

pub fn list_interfaces() -> Vec<InterfaceInfo> {
    datalink::interfaces()
        .into_iter()
        .map(|i| InterfaceInfo {
            addrs: i.ips.iter().map(IpNetwork::ip).collect(),
            up: i.is_up(),
            loopback: i.is_loopback(),
            name: i.name,
        })
        .collect()
}

pub fn interface_exists(name: &str) -> bool {
    datalink::interfaces().iter().any(|i| i.name == name)
}

/// First IPv4 address bound to `name`, used as a source address for sockets
/// that should leave through that interface.
pub fn first_ipv4(name: &str) -> Option<Ipv4Addr> {
    datalink::interfaces().into_iter().find(|i| i.name == name)?.ips.into_iter().find_map(|n| match n {
        IpNetwork::V4(v4) => Some(v4.ip()),
        IpNetwork::V6(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_interface_is_reported() {
        assert!(!interface_exists("definitely-not-a-nic0"));
        assert!(first_ipv4("definitely-not-a-nic0").is_none());
    }

    #[test]
    fn listed_interfaces_exist() {
        for i in list_interfaces() {
            assert!(interface_exists(&i.name));
        }
    }
}
