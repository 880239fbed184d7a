//! Drives an external `nmap` and reads its greppable (`-oG -`) output.

use crate::ScanError;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmapRequest {
    pub target: String,
    pub tcp: bool,
    pub udp: bool,
    pub ports: Option<String>,
    pub top_ports: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NmapPorts {
    pub tcp_open: Vec<u16>,
    /// `open` and `open|filtered` UDP ports.
    pub udp_maybe_open: Vec<u16>,
}

#[derive(Debug)]
pub struct NmapOutcome {
    pub ports: NmapPorts,
    /// The process was asked to stop before it finished.
    pub stopped: bool,
}

pub fn nmap_args(req: &NmapRequest) -> Vec<String> {
    let mut args: Vec<String> = ["-Pn", "-n", "-oG", "-"].iter().map(|s| s.to_string()).collect();
    if req.tcp {
        args.push("-sT".into());
    }
    if req.udp {
        args.push("-sU".into());
    }
    if let Some(p) = &req.ports {
        args.push("-p".into());
        args.push(p.clone());
    } else if let Some(n) = req.top_ports {
        args.push("--top-ports".into());
        args.push(n.to_string());
    }
    args.push(req.target.clone());
    args
}

/// Collects port verdicts from greppable output. Lines other than `Host:`
/// records are ignored.
pub fn parse_greppable(out: &str) -> Result<NmapPorts, ScanError> {
    let entry = Regex::new(r"(\d+)/([a-z|]+)/(tcp|udp)/").map_err(|e| ScanError::Output(e.to_string()))?;
    let mut ports = NmapPorts::default();
    for line in out.lines().filter(|l| l.starts_with("Host:")) {
        let Some((_, list)) = line.split_once("Ports:") else { continue };
        for cap in entry.captures_iter(list) {
            let Ok(port) = cap[1].parse::<u16>() else { continue };
            match (&cap[3], &cap[2]) {
                ("tcp", "open") => ports.tcp_open.push(port),
                ("udp", "open") | ("udp", "open|filtered") => ports.udp_maybe_open.push(port),
                _ => {}
            }
        }
    }
    for v in [&mut ports.tcp_open, &mut ports.udp_maybe_open] {
        v.sort_unstable();
        v.dedup();
    }
    Ok(ports)
}

/// Runs nmap to completion, or until `cancel` fires. On cancel the process
/// gets SIGTERM, then `grace` to exit, then SIGKILL; whatever it printed
/// until then is still parsed.
pub async fn run_nmap(
    binary: &Path,
    req: &NmapRequest,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<NmapOutcome, ScanError> {
    let mut child = Command::new(binary)
        .args(nmap_args(req))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ScanError::Process(format!("spawning {}: {e}", binary.display())))?;
    let mut stdout = child.stdout.take().ok_or_else(|| ScanError::Process("no stdout".into()))?;
    let reader = tokio::spawn(async move {
        let mut s = String::new();
        stdout.read_to_string(&mut s).await.map(|_| s)
    });

    let (stopped, status) = tokio::select! {
        status = child.wait() => (false, Some(status?)),
        _ = cancel.cancelled() => (true, terminate(&mut child, grace).await?),
    };
    let output = reader.await.map_err(|e| ScanError::Process(e.to_string()))??;
    if let Some(status) = status {
        if !stopped && !status.success() {
            return Err(ScanError::Process(format!("nmap exited with {status}")));
        }
    }
    Ok(NmapOutcome { ports: parse_greppable(&output)?, stopped })
}

async fn terminate(child: &mut Child, grace: Duration) -> Result<Option<std::process::ExitStatus>, ScanError> {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(Some(status?)),
        Err(_) => {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "nmap ignored SIGTERM, killing");
            child.kill().await?;
            Ok(None)
        }
    }
}
