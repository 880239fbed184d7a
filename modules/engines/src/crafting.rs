//! Hand-built IPv4 packets with fuzzed header fields, injected through a raw
//! layer-3 channel. Opening the channel needs CAP_NET_RAW or root.

use crate::{EngineContext, EngineError};
use fuzzdeck_core::throttle::Throttle;
use fuzzdeck_core::Transport;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket};
use pnet::transport::{transport_channel, TransportChannelType, TransportSender};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::net::{IpAddr, Ipv4Addr};

const CHANNEL_BUFFER: usize = 4096;
const IPV4_LEN: usize = 20;
const TCP_LEN: usize = 20;
const UDP_LEN: usize = 8;
const TTLS: &[u8] = &[0, 1, 2, 64, 128, 255];
const WINDOWS: &[u16] = &[0, 1, 0x7fff, 0x8000, 0xffff];

/// Header values for one crafted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CraftFields {
    pub ttl: u8,
    pub ip_id: u16,
    pub dont_fragment: bool,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub tcp_flags: u8,
    pub window: u16,
}

impl CraftFields {
    /// Random header values. Most packets still aim at `dport`.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, dport: u16) -> Self {
        CraftFields {
            ttl: if rng.gen_bool(0.5) { *TTLS.choose(rng).unwrap_or(&64) } else { rng.gen() },
            ip_id: rng.gen(),
            dont_fragment: rng.gen(),
            sport: rng.gen_range(1024..=u16::MAX),
            dport: if rng.gen_bool(0.75) { dport } else { rng.gen() },
            seq: rng.gen(),
            ack: rng.gen(),
            tcp_flags: rng.gen(),
            window: if rng.gen_bool(0.5) { *WINDOWS.choose(rng).unwrap_or(&0) } else { rng.gen() },
        }
    }
}

/// Base payload of iteration `i` before anomalies.
pub fn base_payload(i: u64) -> Vec<u8> {
    let mut unit = b"HELLO-".to_vec();
    unit.push((i % 256) as u8);
    unit.repeat(1 + (i % 4) as usize)
}

/// Serializes an IPv4 packet with a TCP or UDP header and valid checksums.
/// Oversized payloads are cut to what fits in one IPv4 packet.
pub fn build_packet(transport: Transport, src: Ipv4Addr, dst: Ipv4Addr, f: &CraftFields, payload: &[u8]) -> Vec<u8> {
    let l4 = match transport {
        Transport::Tcp => TCP_LEN,
        Transport::Udp => UDP_LEN,
    };
    let payload = &payload[..payload.len().min(u16::MAX as usize - IPV4_LEN - l4)];
    let total = IPV4_LEN + l4 + payload.len();
    let mut buf = vec![0u8; total];

    let proto = match transport {
        Transport::Tcp => {
            if let Some(mut p) = MutableTcpPacket::new(&mut buf[IPV4_LEN..]) {
                p.set_source(f.sport);
                p.set_destination(f.dport);
                p.set_sequence(f.seq);
                p.set_acknowledgement(f.ack);
                p.set_data_offset(5);
                p.set_flags(f.tcp_flags.into());
                p.set_window(f.window);
                p.set_payload(payload);
                let sum = tcp::ipv4_checksum(&p.to_immutable(), &src, &dst);
                p.set_checksum(sum);
            }
            IpNextHeaderProtocols::Tcp
        }
        Transport::Udp => {
            if let Some(mut p) = MutableUdpPacket::new(&mut buf[IPV4_LEN..]) {
                p.set_source(f.sport);
                p.set_destination(f.dport);
                p.set_length((UDP_LEN + payload.len()) as u16);
                p.set_payload(payload);
                let sum = udp::ipv4_checksum(&p.to_immutable(), &src, &dst);
                p.set_checksum(sum);
            }
            IpNextHeaderProtocols::Udp
        }
    };

    if let Some(mut ip) = MutableIpv4Packet::new(&mut buf) {
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(total as u16);
        ip.set_identification(f.ip_id);
        ip.set_flags(if f.dont_fragment { Ipv4Flags::DontFragment } else { 0 });
        ip.set_ttl(f.ttl);
        ip.set_next_level_protocol(proto);
        ip.set_source(src);
        ip.set_destination(dst);
        let sum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(sum);
    }
    buf
}

pub struct CraftingEngine {
    tx: TransportSender,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

impl CraftingEngine {
    pub(crate) fn prepare(ctx: &EngineContext) -> Result<Self, EngineError> {
        let IpAddr::V4(dst) = ctx.target.ip() else {
            return Err(EngineError::Spawn("crafting engine supports IPv4 targets only".into()));
        };
        let proto = match ctx.transport {
            Transport::Tcp => IpNextHeaderProtocols::Tcp,
            Transport::Udp => IpNextHeaderProtocols::Udp,
        };
        let (tx, _rx) = transport_channel(CHANNEL_BUFFER, TransportChannelType::Layer3(proto))
            .map_err(|e| EngineError::Spawn(format!("raw channel: {e}")))?;
        let src = fuzzdeck_core::iface::first_ipv4(&ctx.interface).unwrap_or(Ipv4Addr::UNSPECIFIED);
        Ok(CraftingEngine { tx, src, dst })
    }

    pub(crate) async fn run(mut self, ctx: EngineContext) -> Result<(), EngineError> {
        let throttle = Throttle::from_millis(ctx.options.throttle_ms);
        let cancel = ctx.cancel.clone();
        let mut rng = StdRng::from_entropy();
        let mut i: u64 = 0;

        while !cancel.is_cancelled() {
            let payload = ctx.options.anomaly_profile.apply(base_payload(i), &mut rng);
            let fields = CraftFields::random(&mut rng, ctx.target.port());
            let packet = build_packet(ctx.transport, self.src, self.dst, &fields, &payload);
            let sent = match Ipv4Packet::new(&packet) {
                Some(p) => self.tx.send_to(p, IpAddr::V4(self.dst)),
                None => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "short packet")),
            };
            match sent {
                Ok(_) => {
                    ctx.counters.record_sent();
                    ctx.recorder.record_ip_packet(&packet);
                }
                Err(e) => {
                    ctx.counters.record_error();
                    tracing::debug!(run_id = %ctx.run_id, error = %e, "raw send failed");
                }
            }
            i += 1;
            if !throttle.pace(&cancel).await {
                break;
            }
        }
        Ok(())
    }
}
