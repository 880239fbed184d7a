//! TCP connect scan with timeouts, concurrency and cancellation, plus a
//! driver for an external nmap process.

pub mod nmap;

use anyhow::{anyhow, Result};
use fuzzdeck_core::{EventSink, TelemetryEvent};
use rand::{thread_rng, Rng};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Port set scanned when a request names neither ports nor a top-N count.
pub const DEFAULT_PORTS: &str = "1-1024";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("scanner process failed: {0}")]
    Process(String),
    #[error("unreadable scanner output: {0}")]
    Output(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parse a comma-separated list of ports/ranges (e.g., "22,80,443", "1-1024,8080").
pub fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in spec.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let s: u16 = start.trim().parse()?;
            let e: u16 = end.trim().parse()?;
            if s == 0 || e == 0 || s > e {
                return Err(anyhow!("invalid port range: {}", part));
            }
            ports.extend(s..=e);
        } else {
            let p: u16 = part.parse()?;
            if p == 0 {
                return Err(anyhow!("invalid port: {}", part));
            }
            ports.push(p);
        }
    }
    if ports.is_empty() {
        return Err(anyhow!("empty port list"));
    }
    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

/// Return the first N ports from a curated list of commonly-used ports.
pub fn top_ports(n: usize) -> Vec<u16> {
    const CURATED: &[u16] = &[
        21, 22, 23, 25, 53, 80, 110, 123, 135, 139, 143, 389, 443, 445, 465, 500, 587, 636, 993,
        995, 1080, 1194, 1352, 1433, 1521, 1723, 2049, 2375, 2376, 3000, 3128, 3268, 3306, 3389,
        4444, 4500, 5000, 5060, 5432, 5601, 5671, 5672, 5900, 5985, 5986, 6379, 7001, 7002, 8000,
        8080, 8081, 8200, 8443, 8500, 8530, 8888, 9000, 9092, 9200, 9300, 9418, 9999, 10000,
        11211, 15672, 27017,
    ];
    let take = n.min(CURATED.len());
    let mut v = CURATED[..take].to_vec();
    v.sort_unstable();
    v
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub timeout_per_port: Duration,
    pub concurrency: usize,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            timeout_per_port: Duration::from_millis(300),
            concurrency: 256,
            retries: 0,
            retry_delay: Duration::from_millis(50),
        }
    }
}

/// Scan `ports` on `target` with TCP connect. A port is open when the
/// handshake completes. Cancelling returns what was found so far; the result
/// is sorted ascending either way.
pub async fn scan_connect(
    target: &str,
    ports: &[u16],
    opts: &ConnectOptions,
    cancel: &CancellationToken,
    events: &dyn EventSink,
) -> Result<Vec<u16>, ScanError> {
    let host = resolve(target).await?;
    let sem = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for &port in ports {
        let sem = sem.clone();
        let opts = opts.clone();
        tasks.spawn(async move {
            let _permit = sem.acquire_owned().await.ok()?;
            probe_port(host, port, &opts).await.then_some(port)
        });
    }

    let total = ports.len();
    let step = (total / 10).max(1);
    let mut done = 0usize;
    let mut open = Vec::new();
    loop {
        let joined = tokio::select! {
            _ = cancel.cancelled() => {
                tasks.shutdown().await;
                events.emit(TelemetryEvent::info(format!("tcp scan cancelled after {done}/{total} ports")));
                break;
            }
            j = tasks.join_next() => j,
        };
        let Some(res) = joined else { break };
        done += 1;
        if let Ok(Some(port)) = res {
            open.push(port);
        }
        if done % step == 0 || done == total {
            events.emit(TelemetryEvent::info(format!("tcp {done}/{total} ports probed, {} open", open.len())));
        }
    }
    open.sort_unstable();
    Ok(open)
}

async fn probe_port(host: IpAddr, port: u16, opts: &ConnectOptions) -> bool {
    let mut attempts = 0;
    while attempts <= opts.retries {
        if let Ok(Ok(_stream)) = timeout(opts.timeout_per_port, TcpStream::connect((host, port))).await {
            return true;
        }
        attempts += 1;
        if attempts <= opts.retries {
            let base = opts.retry_delay.as_millis() as u64;
            let exp = base.saturating_mul(1u64 << (attempts.min(6))); // cap growth
            let jitter = thread_rng().gen_range(0..(exp / 4 + 1));
            tokio::time::sleep(Duration::from_millis(exp + jitter)).await;
        }
    }
    false
}

/// First address `host` resolves to. IP literals skip the resolver.
pub async fn resolve(host: &str) -> Result<IpAddr, ScanError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    tokio::net::lookup_host((host, 0))
        .await
        .ok()
        .and_then(|mut it| it.next())
        .map(|sa| sa.ip())
        .ok_or_else(|| ScanError::Resolve(host.to_string()))
}
