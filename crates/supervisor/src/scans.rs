//! Scan Supervisor: port discovery jobs with the same lifecycle and
//! two-phase stop as runs. Results live in memory only.

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::hub::{ChannelPublisher, Subscription, TelemetryHub};
use crate::{lock, mark_running, mark_stopping, wait_terminal};
use fuzzdeck_core::shutdown::{stop_within, Shutdown};
use fuzzdeck_core::tools::{resolve_tool, NMAP};
use fuzzdeck_core::{
    EventSink, LifecycleState, RunSummary, ScanId, ScanMethod, ScanSpec, TelemetryEvent, TerminalReason,
};
use port_scan::nmap::{run_nmap, NmapRequest};
use port_scan::{ConnectOptions, ScanError, DEFAULT_PORTS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const UDP_CONCURRENCY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Completed TCP handshakes.
    pub tcp_open: Vec<u16>,
    /// UDP ports that answered or stayed silent; a probable signal only.
    pub udp_maybe_open: Vec<u16>,
    /// The method that actually ran.
    pub method: ScanMethod,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSnapshot {
    pub scan_id: ScanId,
    pub spec: ScanSpec,
    pub state: LifecycleState,
    pub reason: Option<TerminalReason>,
    pub detail: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
    pub result: Option<ScanResult>,
}

struct ScanEntry {
    spec: ScanSpec,
    created_at: String,
    finished_at: Option<String>,
    reason: Option<TerminalReason>,
    detail: Option<String>,
    result: Option<ScanResult>,
    state: watch::Sender<LifecycleState>,
    stop: CancellationToken,
}

struct Inner {
    config: SupervisorConfig,
    hub: Arc<TelemetryHub<ScanId>>,
    scans: Mutex<HashMap<ScanId, ScanEntry>>,
}

#[derive(Clone)]
pub struct ScanSupervisor {
    inner: Arc<Inner>,
}

/// Port list a builtin scan walks.
enum PortSet {
    List(Vec<u16>),
    Top(usize),
}

impl PortSet {
    fn ports(&self) -> Vec<u16> {
        match self {
            PortSet::List(p) => p.clone(),
            PortSet::Top(n) => port_scan::top_ports(*n),
        }
    }
}

fn validate(spec: &ScanSpec) -> Result<PortSet, SupervisorError> {
    let invalid = |m: &str| SupervisorError::Validation(m.to_string());
    if spec.target.trim().is_empty() {
        return Err(invalid("target is required"));
    }
    if !spec.tcp && !spec.udp {
        return Err(invalid("enable at least one of tcp, udp"));
    }
    if spec.timeout_ms == 0 {
        return Err(invalid("timeout_ms must be positive"));
    }
    match (&spec.ports, spec.top_ports) {
        (Some(_), Some(_)) => Err(invalid("ports and top_ports are mutually exclusive")),
        (Some(p), None) => port_scan::parse_ports(p)
            .map(PortSet::List)
            .map_err(|e| SupervisorError::Validation(format!("ports: {e}"))),
        (None, Some(0)) => Err(invalid("top_ports must be positive")),
        (None, Some(n)) => Ok(PortSet::Top(n)),
        (None, None) => port_scan::parse_ports(DEFAULT_PORTS)
            .map(PortSet::List)
            .map_err(|e| SupervisorError::Validation(e.to_string())),
    }
}

impl ScanSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let hub = Arc::new(TelemetryHub::new(config.telemetry_capacity, config.telemetry_history));
        ScanSupervisor { inner: Arc::new(Inner { config, hub, scans: Mutex::new(HashMap::new()) }) }
    }

    pub fn start(&self, spec: ScanSpec) -> Result<ScanId, SupervisorError> {
        let ports = validate(&spec)?;
        let scan_id = ScanId::new();
        let stop = CancellationToken::new();
        let state = watch::channel(LifecycleState::Pending).0;
        {
            let mut scans = lock(&self.inner.scans);
            if scans.contains_key(&scan_id) {
                return Err(SupervisorError::Duplicate(format!("scan {scan_id}")));
            }
            scans.insert(
                scan_id,
                ScanEntry {
                    spec: spec.clone(),
                    created_at: fuzzdeck_core::now_rfc3339(),
                    finished_at: None,
                    reason: None,
                    detail: None,
                    result: None,
                    state: state.clone(),
                    stop: stop.clone(),
                },
            );
        }
        self.inner.hub.open(scan_id);
        let events = ChannelPublisher::new(self.inner.hub.clone(), scan_id);

        let nmap = match spec.method {
            ScanMethod::Nmap => {
                let found = resolve_tool(&NMAP, self.inner.config.nmap.as_deref());
                if found.is_none() {
                    events.emit(TelemetryEvent::info("nmap not found, falling back to builtin scan"));
                }
                found
            }
            ScanMethod::Builtin => None,
        };

        mark_running(&state);
        tracing::info!(%scan_id, target = %spec.target, method = %spec.method, "scan started");
        tokio::spawn(supervise(self.inner.clone(), scan_id, spec, ports, nmap, events, stop));
        Ok(scan_id)
    }

    /// Stops a scan and waits for its terminal state. The partial result
    /// gathered so far is kept.
    pub async fn stop(&self, scan_id: ScanId) -> Result<crate::StopOutcome, SupervisorError> {
        let rx = {
            let scans = lock(&self.inner.scans);
            let entry = scans.get(&scan_id).ok_or_else(|| SupervisorError::NotFound(format!("scan {scan_id}")))?;
            if entry.state.borrow().is_terminal() {
                return Ok(crate::StopOutcome::AlreadyTerminal);
            }
            mark_stopping(&entry.state);
            entry.stop.cancel();
            entry.state.subscribe()
        };
        wait_terminal(rx).await;
        let forced = lock(&self.inner.scans)
            .get(&scan_id)
            .is_some_and(|e| e.reason == Some(TerminalReason::ForcedTermination));
        if forced {
            return Err(SupervisorError::ForcedTermination(format!("scan {scan_id}")));
        }
        Ok(crate::StopOutcome::Stopped)
    }

    pub fn get(&self, scan_id: ScanId) -> Option<ScanSnapshot> {
        lock(&self.inner.scans).get(&scan_id).map(|e| snapshot(scan_id, e))
    }

    pub fn list(&self) -> Vec<ScanSnapshot> {
        let scans = lock(&self.inner.scans);
        let mut out: Vec<ScanSnapshot> = scans.iter().map(|(id, e)| snapshot(*id, e)).collect();
        out.sort_by(|a, b| a.scan_id.cmp(&b.scan_id));
        out
    }

    /// `Some` only once the scan finished (completed or stopped).
    pub fn result(&self, scan_id: ScanId) -> Result<Option<ScanResult>, SupervisorError> {
        let scans = lock(&self.inner.scans);
        let entry = scans.get(&scan_id).ok_or_else(|| SupervisorError::NotFound(format!("scan {scan_id}")))?;
        if *entry.state.borrow() == LifecycleState::Finished {
            Ok(entry.result.clone())
        } else {
            Ok(None)
        }
    }

    pub fn delete(&self, scan_id: ScanId) -> Result<(), SupervisorError> {
        {
            let mut scans = lock(&self.inner.scans);
            let entry = scans.get(&scan_id).ok_or_else(|| SupervisorError::NotFound(format!("scan {scan_id}")))?;
            if entry.state.borrow().is_active() {
                return Err(SupervisorError::StillActive(format!("scan {scan_id}")));
            }
            scans.remove(&scan_id);
        }
        self.inner.hub.remove(&scan_id);
        Ok(())
    }

    pub fn subscribe(&self, scan_id: ScanId) -> Result<Subscription, SupervisorError> {
        self.inner.hub.subscribe(&scan_id).ok_or_else(|| SupervisorError::NotFound(format!("scan {scan_id}")))
    }

    pub fn history(&self, scan_id: ScanId) -> Option<Vec<TelemetryEvent>> {
        self.inner.hub.history(&scan_id)
    }

    /// Stops every active scan concurrently; returns the ids that were
    /// stopped, sorted.
    pub async fn shutdown(&self) -> Vec<ScanId> {
        let active: Vec<ScanId> = lock(&self.inner.scans)
            .iter()
            .filter(|(_, e)| e.state.borrow().is_active())
            .map(|(id, _)| *id)
            .collect();
        let mut tasks = JoinSet::new();
        for id in active {
            let me = self.clone();
            tasks.spawn(async move { (id, me.stop(id).await) });
        }
        let mut stopped = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(crate::StopOutcome::Stopped) | Err(SupervisorError::ForcedTermination(_)))) => {
                    stopped.push(id)
                }
                Ok((_, Ok(crate::StopOutcome::AlreadyTerminal))) => {}
                Ok((id, Err(e))) => tracing::warn!(scan_id = %id, error = %e, "stop failed"),
                Err(e) => tracing::warn!(error = %e, "stop task failed"),
            }
        }
        stopped.sort();
        stopped
    }
}

fn snapshot(scan_id: ScanId, e: &ScanEntry) -> ScanSnapshot {
    let state = *e.state.borrow();
    ScanSnapshot {
        scan_id,
        spec: e.spec.clone(),
        state,
        reason: e.reason,
        detail: e.detail.clone(),
        created_at: e.created_at.clone(),
        finished_at: e.finished_at.clone(),
        result: if state == LifecycleState::Finished { e.result.clone() } else { None },
    }
}

/// Result of the scan worker and whether it was cut short.
type Worked = Result<(ScanResult, bool), ScanError>;

async fn supervise(
    inner: Arc<Inner>,
    scan_id: ScanId,
    spec: ScanSpec,
    ports: PortSet,
    nmap: Option<PathBuf>,
    events: ChannelPublisher<ScanId>,
    stop: CancellationToken,
) {
    let grace = inner.config.stop_grace;
    let work_cancel = CancellationToken::new();
    let events = Arc::new(events);
    let mut work = tokio::spawn(execute(spec, ports, nmap, events.clone(), work_cancel.clone(), grace));

    let joined = tokio::select! {
        j = &mut work => Shutdown::Graceful(j),
        _ = stop.cancelled() => {
            if let Some(entry) = lock(&inner.scans).get(&scan_id) {
                mark_stopping(&entry.state);
            }
            // nmap gets its own grace inside the worker before it is killed.
            stop_within(&work_cancel, &mut work, grace * 2).await
        }
    };

    let (reason, detail, result) = match joined {
        Shutdown::Graceful(Ok(Ok((result, cut_short)))) => {
            let reason = if cut_short || stop.is_cancelled() { TerminalReason::Stopped } else { TerminalReason::Completed };
            (reason, None, Some(result))
        }
        Shutdown::Graceful(Ok(Err(e))) => {
            events.emit(TelemetryEvent::error(e.to_string()));
            (TerminalReason::ScanFailure, Some(e.to_string()), None)
        }
        Shutdown::Graceful(Err(e)) => {
            events.emit(TelemetryEvent::error(format!("scan task ended abnormally: {e}")));
            (TerminalReason::ScanFailure, Some(e.to_string()), None)
        }
        Shutdown::Forced => (
            TerminalReason::ForcedTermination,
            Some(format!("scan did not stop within {} ms", (grace * 2).as_millis())),
            None,
        ),
    };

    let summary = RunSummary {
        state: reason.terminal_state(),
        reason,
        detail: detail.clone(),
        sent: 0,
        errors: 0,
        artifact: None,
        result: result.as_ref().and_then(|r| serde_json::to_value(r).ok()),
    };
    events.emit(TelemetryEvent::Finished { summary });
    {
        let mut scans = lock(&inner.scans);
        if let Some(entry) = scans.get_mut(&scan_id) {
            entry.reason = Some(reason);
            entry.detail = detail;
            entry.result = result;
            entry.finished_at = Some(fuzzdeck_core::now_rfc3339());
            entry.state.send_replace(reason.terminal_state());
        }
    }
    inner.hub.close(&scan_id);
    tracing::info!(%scan_id, %reason, "scan ended");
}

async fn execute(
    spec: ScanSpec,
    ports: PortSet,
    nmap: Option<PathBuf>,
    events: Arc<ChannelPublisher<ScanId>>,
    cancel: CancellationToken,
    grace: Duration,
) -> Worked {
    let timeout = Duration::from_millis(spec.timeout_ms);
    if let Some(binary) = nmap {
        let req = NmapRequest {
            target: spec.target.clone(),
            tcp: spec.tcp,
            udp: spec.udp,
            ports: spec.ports.clone(),
            top_ports: spec.top_ports,
        };
        events.emit(TelemetryEvent::info(format!("running {}", binary.display())));
        let out = run_nmap(&binary, &req, &cancel, grace).await?;
        let result = ScanResult {
            tcp_open: out.ports.tcp_open,
            udp_maybe_open: out.ports.udp_maybe_open,
            method: ScanMethod::Nmap,
        };
        return Ok((result, out.stopped));
    }

    let ports = ports.ports();
    let mut result = ScanResult { tcp_open: Vec::new(), udp_maybe_open: Vec::new(), method: ScanMethod::Builtin };
    if spec.tcp {
        let opts = ConnectOptions { timeout_per_port: timeout, ..ConnectOptions::default() };
        result.tcp_open = port_scan::scan_connect(&spec.target, &ports, &opts, &cancel, events.as_ref()).await?;
    }
    if spec.udp && !cancel.is_cancelled() {
        let host = port_scan::resolve(&spec.target).await?;
        let verdicts =
            udp_probe::probe_ports(host, &ports, timeout, UDP_CONCURRENCY, &cancel, events.as_ref()).await;
        result.udp_maybe_open =
            verdicts.into_iter().filter(|(_, v)| v.is_maybe_open()).map(|(p, _)| p).collect();
    }
    Ok((result, cancel.is_cancelled()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ScanSpec {
        ScanSpec::builtin("127.0.0.1", "22")
    }

    #[test]
    fn validation() {
        assert!(validate(&spec()).is_ok());
        let mut s = spec();
        s.tcp = false;
        assert!(matches!(validate(&s), Err(SupervisorError::Validation(_))));
        let mut s = spec();
        s.top_ports = Some(10);
        assert!(matches!(validate(&s), Err(SupervisorError::Validation(_))));
        let mut s = spec();
        s.timeout_ms = 0;
        assert!(validate(&s).is_err());
        let mut s = spec();
        s.ports = Some("0-5".into());
        assert!(validate(&s).is_err());
        let mut s = spec();
        s.target = String::new();
        assert!(validate(&s).is_err());
    }

    #[test]
    fn default_port_set() {
        let mut s = spec();
        s.ports = None;
        match validate(&s).unwrap() {
            PortSet::List(p) => assert_eq!(p.len(), 1024),
            PortSet::Top(_) => panic!("expected list"),
        }
    }
}
