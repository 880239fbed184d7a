//! Synthesized Ethernet frames for payloads observed at the socket layer.

use fuzzdeck_core::Transport;
use pnet::packet::ethernet::{EtherType, EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags};
use pnet::packet::udp::{self, MutableUdpPacket};
use pnet::util::MacAddr;
use std::net::{IpAddr, SocketAddr};

const ETH_LEN: usize = 14;
const IPV4_LEN: usize = 20;
const IPV6_LEN: usize = 40;
const TCP_LEN: usize = 20;
const UDP_LEN: usize = 8;

/// Builds an Ethernet frame carrying `payload` from `src` to `dst`. Returns
/// `None` when the two addresses are of different families. Payloads beyond
/// what a single IP packet can carry are truncated.
pub fn synthesize(transport: Transport, src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    let l4 = match transport {
        Transport::Tcp => TCP_LEN,
        Transport::Udp => UDP_LEN,
    };
    let (ip_len, ethertype) = match (src.ip(), dst.ip()) {
        (IpAddr::V4(_), IpAddr::V4(_)) => (IPV4_LEN, EtherTypes::Ipv4),
        (IpAddr::V6(_), IpAddr::V6(_)) => (IPV6_LEN, EtherTypes::Ipv6),
        _ => return None,
    };
    let max_payload = u16::MAX as usize - ip_len - l4;
    let payload = &payload[..payload.len().min(max_payload)];

    let mut seg = vec![0u8; l4 + payload.len()];
    let proto = match transport {
        Transport::Tcp => {
            let mut p = MutableTcpPacket::new(&mut seg)?;
            p.set_source(src.port());
            p.set_destination(dst.port());
            p.set_sequence(1);
            p.set_acknowledgement(1);
            p.set_data_offset(5);
            p.set_flags(TcpFlags::PSH | TcpFlags::ACK);
            p.set_window(u16::MAX);
            p.set_payload(payload);
            let sum = match (src.ip(), dst.ip()) {
                (IpAddr::V4(s), IpAddr::V4(d)) => tcp::ipv4_checksum(&p.to_immutable(), &s, &d),
                (IpAddr::V6(s), IpAddr::V6(d)) => tcp::ipv6_checksum(&p.to_immutable(), &s, &d),
                _ => 0,
            };
            p.set_checksum(sum);
            IpNextHeaderProtocols::Tcp
        }
        Transport::Udp => {
            let mut p = MutableUdpPacket::new(&mut seg)?;
            p.set_source(src.port());
            p.set_destination(dst.port());
            p.set_length((UDP_LEN + payload.len()) as u16);
            p.set_payload(payload);
            let sum = match (src.ip(), dst.ip()) {
                (IpAddr::V4(s), IpAddr::V4(d)) => udp::ipv4_checksum(&p.to_immutable(), &s, &d),
                (IpAddr::V6(s), IpAddr::V6(d)) => udp::ipv6_checksum(&p.to_immutable(), &s, &d),
                _ => 0,
            };
            p.set_checksum(sum);
            IpNextHeaderProtocols::Udp
        }
    };

    let ip = build_ip(src.ip(), dst.ip(), proto, &seg)?;
    ethernet(ethertype, &ip)
}

/// Wraps an already built IP packet (crafted traffic) in an Ethernet header.
pub fn wrap_ip(packet: &[u8]) -> Option<Vec<u8>> {
    let ethertype = match packet.first()? >> 4 {
        4 => EtherTypes::Ipv4,
        6 => EtherTypes::Ipv6,
        _ => return None,
    };
    ethernet(ethertype, packet)
}

fn build_ip(src: IpAddr, dst: IpAddr, proto: IpNextHeaderProtocol, seg: &[u8]) -> Option<Vec<u8>> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let mut buf = vec![0u8; IPV4_LEN + seg.len()];
            let mut p = MutableIpv4Packet::new(&mut buf)?;
            p.set_version(4);
            p.set_header_length(5);
            p.set_total_length((IPV4_LEN + seg.len()) as u16);
            p.set_ttl(64);
            p.set_next_level_protocol(proto);
            p.set_source(s);
            p.set_destination(d);
            p.set_payload(seg);
            let sum = ipv4::checksum(&p.to_immutable());
            p.set_checksum(sum);
            Some(buf)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let mut buf = vec![0u8; IPV6_LEN + seg.len()];
            let mut p = MutableIpv6Packet::new(&mut buf)?;
            p.set_version(6);
            p.set_payload_length(seg.len() as u16);
            p.set_next_header(proto);
            p.set_hop_limit(64);
            p.set_source(s);
            p.set_destination(d);
            p.set_payload(seg);
            Some(buf)
        }
        _ => None,
    }
}

fn ethernet(ethertype: EtherType, ip: &[u8]) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; ETH_LEN + ip.len()];
    let mut eth = MutableEthernetPacket::new(&mut buf)?;
    eth.set_destination(MacAddr::zero());
    eth.set_source(MacAddr::zero());
    eth.set_ethertype(ethertype);
    eth.set_payload(ip);
    Some(buf)
}
