use crate::mutator::{builtin_mutate, Mutator};
use crate::net::{Conn, Link};
use crate::{seed_at, EngineContext, EngineError};
use fuzzdeck_core::throttle::Throttle;
use fuzzdeck_core::Transport;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;

const DEFAULT_SEED: &[u8] = b"PING";
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Seed-driven mutation: every iteration takes the next seed, mutates it,
/// adds an anomaly and sends it.
pub struct MutationEngine {
    mutator: Mutator,
    link: Link,
}

impl MutationEngine {
    pub(crate) async fn prepare(ctx: &EngineContext) -> Result<Self, EngineError> {
        let opts = &ctx.options;
        let mutator = match &ctx.mutator_path {
            Some(path) => {
                let m = Mutator::External { path: path.clone(), timeout: opts.io_timeout };
                // Prove the binary runs before committing to it.
                let mut rng = StdRng::from_entropy();
                match m.mutate(seed_at(&ctx.seeds, 0, DEFAULT_SEED), &mut rng).await {
                    Ok(_) => m,
                    Err(e) if opts.require_external_mutator => {
                        return Err(EngineError::Spawn(format!("mutator {} failed: {e}", path.display())));
                    }
                    Err(e) => {
                        ctx.info(format!("mutator {} unusable ({e}), using builtin mutations", path.display()));
                        Mutator::Builtin
                    }
                }
            }
            None if opts.require_external_mutator => {
                return Err(EngineError::Spawn("external mutator not found".into()));
            }
            None => {
                ctx.info("external mutator not found, using builtin mutations");
                Mutator::Builtin
            }
        };
        tracing::debug!(run_id = %ctx.run_id, mutator = mutator.name(), "mutation engine ready");
        Ok(MutationEngine { mutator, link: ctx.link() })
    }

    pub(crate) async fn run(self, ctx: EngineContext) -> Result<(), EngineError> {
        let throttle = Throttle::from_millis(ctx.options.throttle_ms);
        let cancel = ctx.cancel.clone();
        let mut rng = StdRng::from_entropy();
        // UDP keeps one connected socket for the run, TCP connects per send.
        let mut udp: Option<Conn> = None;
        let mut i: u64 = 0;

        while !cancel.is_cancelled() {
            let seed = seed_at(&ctx.seeds, i, DEFAULT_SEED);
            let mutated = match self.mutator.mutate(seed, &mut rng).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(run_id = %ctx.run_id, error = %e, "external mutation failed, using builtin");
                    builtin_mutate(seed, &mut rng)
                }
            };
            let payload = ctx.options.anomaly_profile.apply(mutated, &mut rng);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.send_one(&mut udp, &payload) => r,
            };
            match outcome {
                Ok(()) => ctx.counters.record_sent(),
                Err(e) => {
                    ctx.counters.record_error();
                    tracing::debug!(run_id = %ctx.run_id, error = %e, "send failed");
                    udp = None;
                    if !Throttle::pause(ERROR_BACKOFF, &cancel).await {
                        break;
                    }
                }
            }

            i += 1;
            if !throttle.pace(&cancel).await {
                break;
            }
        }
        Ok(())
    }

    async fn send_one(&self, udp: &mut Option<Conn>, payload: &[u8]) -> std::io::Result<()> {
        match self.link.transport {
            Transport::Tcp => {
                let mut conn = self.link.open().await?;
                self.link.send(&mut conn, payload).await?;
                self.link.recv(&mut conn).await;
            }
            Transport::Udp => {
                if udp.is_none() {
                    *udp = Some(self.link.open().await?);
                }
                if let Some(conn) = udp.as_mut() {
                    self.link.send(conn, payload).await?;
                    self.link.recv(conn).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture::{CaptureConfig, CaptureSink};
    use fuzzdeck_core::{EngineKind, RunId};
    use tokio::net::UdpSocket;

    async fn udp_echo() -> std::net::SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            while let Ok((n, from)) = sock.recv_from(&mut buf).await {
                let _ = sock.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn udp_run_against_echo_sends_without_errors() {
        let target = udp_echo().await;
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let trace = dir.path().join("t.pcap");
        let sink = CaptureSink::open(&CaptureConfig { sniff: false, snaplen: 65535 }, "lo", run_id, &trace).unwrap();

        let mut ctx = EngineContext::new(run_id, target, Transport::Udp, "lo");
        ctx.options.throttle_ms = 0;
        ctx.seeds = vec![b"hello".to_vec()];
        ctx.recorder = sink.recorder();
        let counters = ctx.counters.clone();

        let mut handle = crate::start(EngineKind::Mutation, ctx).await.unwrap();
        assert!(handle.is_alive());
        tokio::time::sleep(Duration::from_millis(300)).await;
        let out = handle.stop(Duration::from_secs(2)).await;
        assert!(!out.is_forced());

        assert!(counters.sent() > 0);
        assert_eq!(counters.errors(), 0);
        assert!(sink.close().unwrap().frames > 0);
    }

    #[tokio::test]
    async fn required_mutator_missing_is_spawn_failure() {
        let mut ctx = EngineContext::new(RunId::new(), "127.0.0.1:9".parse().unwrap(), Transport::Udp, "lo");
        ctx.options.require_external_mutator = true;
        match crate::start(EngineKind::Mutation, ctx).await {
            Err(EngineError::Spawn(_)) => {}
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("engine started without its mutator"),
        }
    }
}
