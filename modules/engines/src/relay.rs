//! Mutating relay between local clients and the DUT.
//!
//! TCP: every accepted client gets its own upstream connection and two
//! pumps, one per direction. UDP: every client address gets its own
//! connected upstream socket whose replies are sent back to that client.
//! Both directions pass through the anomaly profile.

use crate::net::within;
use crate::{EngineContext, EngineError};
use fuzzdeck_core::throttle::Throttle;
use fuzzdeck_core::Transport;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;

const CHUNK: usize = 4096;
const MAX_DATAGRAM: usize = 65535;

enum Listener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

pub struct RelayEngine {
    listener: Listener,
}

/// Direction a relayed chunk travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToDut,
    ToClient,
}

impl RelayEngine {
    pub(crate) async fn prepare(ctx: &EngineContext) -> Result<Self, EngineError> {
        let bind = format!("{}:{}", ctx.options.proxy_bind_host, ctx.options.proxy_bind_port);
        let listener = match ctx.transport {
            Transport::Tcp => Listener::Tcp(
                TcpListener::bind(&bind).await.map_err(|e| EngineError::Spawn(format!("relay bind {bind}: {e}")))?,
            ),
            Transport::Udp => Listener::Udp(Arc::new(
                UdpSocket::bind(&bind).await.map_err(|e| EngineError::Spawn(format!("relay bind {bind}: {e}")))?,
            )),
        };
        let engine = RelayEngine { listener };
        if let Some(addr) = engine.local_addr() {
            ctx.info(format!("relay {} listening on {addr} -> {}", ctx.transport, ctx.target));
        }
        Ok(engine)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Udp(s) => s.local_addr().ok(),
        }
    }

    pub(crate) async fn run(self, ctx: EngineContext) -> Result<(), EngineError> {
        let ctx = Arc::new(ctx);
        let mut tasks = JoinSet::new();
        let res = match self.listener {
            Listener::Tcp(l) => accept_loop(l, &ctx, &mut tasks).await,
            Listener::Udp(s) => datagram_loop(s, &ctx, &mut tasks).await,
        };
        tasks.shutdown().await;
        res
    }
}

async fn accept_loop(listener: TcpListener, ctx: &Arc<EngineContext>, tasks: &mut JoinSet<()>) -> Result<(), EngineError> {
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
            a = listener.accept() => a,
        };
        match accepted {
            Ok((client, peer)) => {
                tracing::debug!(run_id = %ctx.run_id, %peer, "relay client connected");
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    if let Err(e) = relay_tcp(client, peer, &ctx).await {
                        ctx.counters.record_error();
                        tracing::debug!(run_id = %ctx.run_id, %peer, error = %e, "relay session ended with error");
                    }
                });
            }
            Err(e) => {
                ctx.counters.record_error();
                tracing::warn!(run_id = %ctx.run_id, error = %e, "relay accept failed");
            }
        }
    }
}

async fn relay_tcp(client: TcpStream, peer: SocketAddr, ctx: &EngineContext) -> io::Result<()> {
    let upstream = within(ctx.options.io_timeout, TcpStream::connect(ctx.target)).await?;
    let up_local = upstream.local_addr()?;
    let (cr, cw) = client.into_split();
    let (ur, uw) = upstream.into_split();
    // Either side closing ends the session.
    tokio::select! {
        r = pump(cr, uw, Direction::ToDut, (up_local, ctx.target), ctx) => r,
        r = pump(ur, cw, Direction::ToClient, (ctx.target, peer), ctx) => r,
        _ = ctx.cancel.cancelled() => Ok(()),
    }
}

async fn pump(
    mut from: OwnedReadHalf,
    mut to: OwnedWriteHalf,
    dir: Direction,
    (src, dst): (SocketAddr, SocketAddr),
    ctx: &EngineContext,
) -> io::Result<()> {
    let throttle = Throttle::from_millis(ctx.options.throttle_ms);
    let mut rng = StdRng::from_entropy();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let data = ctx.options.anomaly_profile.apply(buf[..n].to_vec(), &mut rng);
        to.write_all(&data).await?;
        ctx.counters.record_sent();
        ctx.recorder.record_payload(Transport::Tcp, src, dst, &data);
        tracing::trace!(run_id = %ctx.run_id, ?dir, len = data.len(), "relayed");
        if !throttle.is_unthrottled() && !throttle.pace(&ctx.cancel).await {
            return Ok(());
        }
    }
}

async fn datagram_loop(front: Arc<UdpSocket>, ctx: &Arc<EngineContext>, tasks: &mut JoinSet<()>) -> Result<(), EngineError> {
    let mut upstreams: HashMap<SocketAddr, Arc<UdpSocket>> = HashMap::new();
    let mut rng = StdRng::from_entropy();
    let throttle = Throttle::from_millis(ctx.options.throttle_ms);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            r = front.recv_from(&mut buf) => r,
        };
        let (n, client) = match received {
            Ok(r) => r,
            Err(e) => {
                // ICMP errors from earlier replies surface here on some stacks.
                tracing::debug!(run_id = %ctx.run_id, error = %e, "relay receive failed");
                continue;
            }
        };
        let up = match upstreams.get(&client) {
            Some(up) => up.clone(),
            None => match open_upstream(ctx.target).await {
                Ok(up) => {
                    tasks.spawn(replies(up.clone(), front.clone(), client, ctx.clone()));
                    upstreams.insert(client, up.clone());
                    up
                }
                Err(e) => {
                    ctx.counters.record_error();
                    tracing::debug!(run_id = %ctx.run_id, error = %e, "relay upstream socket failed");
                    continue;
                }
            },
        };
        let data = ctx.options.anomaly_profile.apply(buf[..n].to_vec(), &mut rng);
        match up.send(&data).await {
            Ok(_) => {
                ctx.counters.record_sent();
                if let Ok(local) = up.local_addr() {
                    ctx.recorder.record_payload(Transport::Udp, local, ctx.target, &data);
                }
            }
            Err(e) => {
                ctx.counters.record_error();
                tracing::debug!(run_id = %ctx.run_id, error = %e, "relay send to target failed");
            }
        }
        if !throttle.is_unthrottled() && !throttle.pace(&ctx.cancel).await {
            return Ok(());
        }
    }
}

async fn open_upstream(target: SocketAddr) -> io::Result<Arc<UdpSocket>> {
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let sock = UdpSocket::bind(bind).await?;
    sock.connect(target).await?;
    Ok(Arc::new(sock))
}

async fn replies(up: Arc<UdpSocket>, front: Arc<UdpSocket>, client: SocketAddr, ctx: Arc<EngineContext>) {
    let mut rng = StdRng::from_entropy();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            r = up.recv(&mut buf) => match r {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(run_id = %ctx.run_id, error = %e, "relay upstream receive failed");
                    continue;
                }
            },
        };
        let data = ctx.options.anomaly_profile.apply(buf[..n].to_vec(), &mut rng);
        match front.send_to(&data, client).await {
            Ok(_) => {
                ctx.counters.record_sent();
                ctx.recorder.record_payload(Transport::Udp, ctx.target, client, &data);
            }
            Err(_) => ctx.counters.record_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineHandle;
    use fuzzdeck_core::Counters;
    use fuzzdeck_core::{EngineKind, RunId};
    use std::time::Duration;

    async fn start_relay(target: SocketAddr, transport: Transport) -> (EngineHandle, Arc<Counters>) {
        let mut ctx = EngineContext::new(RunId::new(), target, transport, "lo");
        ctx.options.proxy_bind_host = "127.0.0.1".into();
        ctx.options.proxy_bind_port = 0;
        ctx.options.throttle_ms = 0;
        let counters = ctx.counters.clone();
        (crate::start(EngineKind::Relay, ctx).await.unwrap(), counters)
    }

    #[tokio::test]
    async fn tcp_relay_forwards_both_ways() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = s.read(&mut buf).await.unwrap();
            s.write_all(&buf[..n]).await.unwrap();
        });

        let (mut handle, counters) = start_relay(target, Transport::Tcp).await;
        let front = handle.listen_addr().unwrap();
        let mut client = TcpStream::connect(front).await.unwrap();
        client.write_all(b"through").await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"through");
        assert!(!handle.stop(Duration::from_secs(2)).await.is_forced());
        assert!(counters.sent() >= 1);
    }

    #[tokio::test]
    async fn udp_relay_returns_replies_to_client() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let (mut handle, counters) = start_relay(target, Transport::Udp).await;
        let front = handle.listen_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"dgram", front).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"dgram");
        assert!(!handle.stop(Duration::from_secs(2)).await.is_forced());
        assert!(counters.sent() >= 1);
    }

    #[tokio::test]
    async fn occupied_port_is_spawn_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut ctx = EngineContext::new(RunId::new(), "127.0.0.1:9".parse().unwrap(), Transport::Tcp, "lo");
        ctx.options.proxy_bind_host = "127.0.0.1".into();
        ctx.options.proxy_bind_port = taken.local_addr().unwrap().port();
        assert!(matches!(crate::start(EngineKind::Relay, ctx).await, Err(EngineError::Spawn(_))));
    }
}
