//! UDP port probing.
//!
//! UDP has no handshake, so openness is inferred: an ICMP port-unreachable
//! (surfaced as `ConnectionRefused` on a connected socket) means closed, a
//! reply means something answered, and silence within the timeout is only
//! "maybe open". A filtered port and an open port that ignores the probe look
//! the same; callers must treat `MaybeOpen` as a probabilistic signal.

use anyhow::{bail, Result};
use fuzzdeck_core::{EventSink, TelemetryEvent};
use rand::Rng;
use serde::Serialize;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UdpVerdict {
    /// A datagram came back.
    Responded,
    /// Nothing came back within the timeout.
    MaybeOpen,
    /// The host answered with port unreachable.
    Closed,
}

impl UdpVerdict {
    /// Both answers and silence count as "maybe open" in scan results.
    pub fn is_maybe_open(&self) -> bool {
        !matches!(self, UdpVerdict::Closed)
    }
}

pub async fn probe_udp_port(host: IpAddr, port: u16, payload: &[u8], wait: Duration) -> io::Result<UdpVerdict> {
    let local = match host {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let sock = UdpSocket::bind(local).await?;
    sock.connect((host, port)).await?;
    match sock.send(payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => return Ok(UdpVerdict::Closed),
        Err(e) => return Err(e),
    }
    let mut buf = [0u8; 1500];
    match timeout(wait, sock.recv(&mut buf)).await {
        Ok(Ok(_)) => Ok(UdpVerdict::Responded),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(UdpVerdict::Closed),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(UdpVerdict::MaybeOpen),
    }
}

/// Probe payload that well-known services are likely to answer.
pub fn payload_for(port: u16) -> Vec<u8> {
    match port {
        53 => dns_query("example.com", rand::thread_rng().gen()).unwrap_or_default(),
        123 => ntp_request().to_vec(),
        _ => Vec::new(),
    }
}

/// Probes every port with bounded concurrency. Cancelling returns the
/// verdicts gathered so far. Output is sorted by port.
pub async fn probe_ports(
    host: IpAddr,
    ports: &[u16],
    wait: Duration,
    concurrency: usize,
    cancel: &CancellationToken,
    events: &dyn EventSink,
) -> Vec<(u16, UdpVerdict)> {
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for &port in ports {
        let sem = sem.clone();
        tasks.spawn(async move {
            let _permit = sem.acquire_owned().await.ok()?;
            match probe_udp_port(host, port, &payload_for(port), wait).await {
                Ok(v) => Some((port, v)),
                Err(e) => {
                    tracing::debug!(port, error = %e, "udp probe failed");
                    None
                }
            }
        });
    }

    let total = ports.len();
    let step = (total / 10).max(1);
    let mut done = 0usize;
    let mut out = Vec::new();
    loop {
        let joined = tokio::select! {
            _ = cancel.cancelled() => {
                tasks.shutdown().await;
                break;
            }
            j = tasks.join_next() => j,
        };
        let Some(res) = joined else { break };
        done += 1;
        if let Ok(Some(v)) = res {
            out.push(v);
        }
        if done % step == 0 || done == total {
            let maybe = out.iter().filter(|(_, v)| v.is_maybe_open()).count();
            events.emit(TelemetryEvent::info(format!("udp {done}/{total} ports probed, {maybe} maybe open")));
        }
    }
    out.sort_unstable_by_key(|(p, _)| *p);
    out
}

/// Standard recursive DNS query for the A record of `qname`.
pub fn dns_query(qname: &str, txid: u16) -> Result<Vec<u8>> {
    let mut q = Vec::new();
    q.extend_from_slice(&txid.to_be_bytes()); // ID
    q.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    q.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    q.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    q.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    q.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT
    for part in qname.trim_end_matches('.').split('.') {
        if part.is_empty() || part.len() > 63 {
            bail!("invalid DNS label in {qname:?}");
        }
        q.push(part.len() as u8);
        q.extend_from_slice(part.as_bytes());
    }
    q.push(0); // end name
    q.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    q.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    Ok(q)
}

/// NTPv4 client request.
pub fn ntp_request() -> [u8; 48] {
    let mut pkt = [0u8; 48];
    pkt[0] = 0b00_100_011; // LI=0, VN=4, Mode=3 (client)
    pkt
}
