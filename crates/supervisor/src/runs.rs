//! Run Supervisor: validates run requests, acquires capture and engine,
//! then drives each run to a terminal state with a fixed teardown order:
//! stop engine, close capture, publish `finished`, persist, mark terminal,
//! close the telemetry channel.

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::hub::{ChannelPublisher, Subscription, TelemetryHub};
use crate::{lock, mark_running, mark_stopping, wait_terminal};
use capture::CaptureSink;
use engines::{EngineContext, EngineError, EngineHandle, EngineOptions};
use fuzzdeck_core::shutdown::Shutdown;
use fuzzdeck_core::tools::{resolve_tool, RADAMSA};
use fuzzdeck_core::{
    iface, Counters, LifecycleState, RunId, RunSpec, RunSummary, TelemetryEvent, TerminalReason,
};
use run_store::{RunMetadata, RunPaths, RunStore};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Point-in-time view of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub spec: RunSpec,
    pub state: LifecycleState,
    pub reason: Option<TerminalReason>,
    pub detail: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
    pub sent: u64,
    pub errors: u64,
    pub paths: RunPaths,
    /// Relay listener address.
    pub listen_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    AlreadyTerminal,
}

/// One run per (port, instance) against a shared base request.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub base: RunSpec,
    /// Out-of-range entries are skipped.
    pub ports: Vec<u32>,
    pub instances: u32,
}

pub const MAX_PLAN_INSTANCES: u32 = 32;

struct RunEntry {
    spec: RunSpec,
    created_at: String,
    finished_at: Option<String>,
    reason: Option<TerminalReason>,
    detail: Option<String>,
    state: watch::Sender<LifecycleState>,
    counters: Arc<Counters>,
    stop: CancellationToken,
    /// Set when the supervising task ended the run because of `stop`.
    stopped_by_request: bool,
    listen_addr: Option<SocketAddr>,
}

struct Inner {
    config: SupervisorConfig,
    store: RunStore,
    hub: Arc<TelemetryHub<RunId>>,
    runs: Mutex<HashMap<RunId, RunEntry>>,
}

#[derive(Clone)]
pub struct RunSupervisor {
    inner: Arc<Inner>,
}

struct Prepared {
    target: SocketAddr,
    seeds: Vec<Vec<u8>>,
    options: EngineOptions,
}

impl RunSupervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let store = RunStore::open_or_create(&config.runs_dir).map_err(|e| SupervisorError::Storage(format!("{e:#}")))?;
        let hub = Arc::new(TelemetryHub::new(config.telemetry_capacity, config.telemetry_history));
        Ok(RunSupervisor { inner: Arc::new(Inner { config, store, hub, runs: Mutex::new(HashMap::new()) }) })
    }

    pub fn store(&self) -> &RunStore {
        &self.inner.store
    }

    pub async fn start(&self, spec: RunSpec) -> Result<RunId, SupervisorError> {
        self.start_with_id(RunId::new(), spec).await
    }

    /// Starts a run under a caller-chosen id. Of concurrent starts for one
    /// id exactly one registers; the others get `Duplicate`.
    pub async fn start_with_id(&self, run_id: RunId, spec: RunSpec) -> Result<RunId, SupervisorError> {
        let kind = spec.engine;
        self.launch(run_id, spec, move |ctx| engines::start(kind, ctx)).await
    }

    /// Registration, artifacts and capture for a run whose engine comes from
    /// `start_engine`.
    async fn launch<F, Fut>(&self, run_id: RunId, spec: RunSpec, start_engine: F) -> Result<RunId, SupervisorError>
    where
        F: FnOnce(EngineContext) -> Fut,
        Fut: Future<Output = Result<EngineHandle, EngineError>>,
    {
        let prepared = validate(&spec).await?;
        let inner = &self.inner;
        let paths = inner.store.paths(&run_id);
        let meta = RunMetadata::new(run_id, spec.clone());
        let counters = Arc::new(Counters::default());
        let stop = CancellationToken::new();
        {
            let mut runs = lock(&inner.runs);
            if runs.contains_key(&run_id) || paths.dir.exists() {
                return Err(SupervisorError::Duplicate(format!("run {run_id}")));
            }
            runs.insert(
                run_id,
                RunEntry {
                    spec: spec.clone(),
                    created_at: meta.created_at.clone(),
                    finished_at: None,
                    reason: None,
                    detail: None,
                    state: watch::channel(LifecycleState::Pending).0,
                    counters: counters.clone(),
                    stop: stop.clone(),
                    stopped_by_request: false,
                    listen_addr: None,
                },
            );
        }
        inner.hub.open(run_id);

        let opened = inner.store.begin_run(&meta).and_then(|_| inner.store.open_event_log(&run_id));
        match opened {
            Ok(log) => {
                inner.hub.attach_log(&run_id, log);
            }
            Err(e) => {
                let err = SupervisorError::Storage(format!("{e:#}"));
                inner.fail_start(meta, &err).await;
                return Err(err);
            }
        }

        let sink = match CaptureSink::open(&inner.config.capture, &spec.interface, run_id, &paths.trace) {
            Ok(sink) => sink,
            Err(e) => {
                let err = SupervisorError::from(e);
                inner.fail_start(meta, &err).await;
                return Err(err);
            }
        };

        let mut ctx = EngineContext::new(run_id, prepared.target, spec.transport, spec.interface.clone());
        ctx.seeds = prepared.seeds;
        ctx.options = prepared.options;
        ctx.counters = counters.clone();
        ctx.events = Arc::new(ChannelPublisher::new(inner.hub.clone(), run_id));
        ctx.recorder = sink.recorder();
        ctx.mutator_path = resolve_tool(&RADAMSA, inner.config.radamsa.as_deref());

        let engine = match start_engine(ctx).await {
            Ok(handle) => handle,
            Err(e) => {
                let err = SupervisorError::from(e);
                if let Err(ce) = close_capture(sink).await {
                    tracing::warn!(%run_id, error = %ce, "closing capture after failed start");
                }
                inner.fail_start(meta, &err).await;
                return Err(err);
            }
        };

        let mut meta = meta;
        meta.state = LifecycleState::Running;
        if let Err(e) = inner.store.write_metadata(&meta) {
            tracing::warn!(%run_id, error = %format!("{e:#}"), "updating run metadata");
        }
        {
            let mut runs = lock(&inner.runs);
            if let Some(entry) = runs.get_mut(&run_id) {
                entry.listen_addr = engine.listen_addr();
                mark_running(&entry.state);
            }
        }
        tracing::info!(%run_id, engine = %spec.engine, target = %prepared.target, "run started");
        tokio::spawn(supervise(inner.clone(), meta, engine, sink, counters, stop));
        Ok(run_id)
    }

    /// Starts every run of `plan`. If one fails, the runs already started
    /// are stopped and the error is returned.
    pub async fn start_plan(&self, plan: RunPlan) -> Result<Vec<RunId>, SupervisorError> {
        if !(1..=MAX_PLAN_INSTANCES).contains(&plan.instances) {
            return Err(SupervisorError::Validation(format!("instances must be in 1-{MAX_PLAN_INSTANCES}")));
        }
        let ports: Vec<u16> = plan.ports.iter().filter_map(|&p| u16::try_from(p).ok()).filter(|&p| p != 0).collect();
        if ports.is_empty() {
            return Err(SupervisorError::Validation("no valid ports provided".into()));
        }
        let mut ids = Vec::with_capacity(ports.len() * plan.instances as usize);
        for port in ports {
            for _ in 0..plan.instances {
                let mut spec = plan.base.clone();
                spec.target_port = port;
                match self.start(spec).await {
                    Ok(id) => ids.push(id),
                    Err(e) => {
                        for id in &ids {
                            let _ = self.stop(*id).await;
                        }
                        return Err(e);
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Stops a run and waits until it is terminal. `Stopped` means a stop
    /// request ended the run, and `ForcedTermination` that its engine had
    /// to be aborted. A run that was already terminal, or that ended on its
    /// own meanwhile (a start that failed while pending, an engine exit,
    /// expiry), reports `AlreadyTerminal`.
    pub async fn stop(&self, run_id: RunId) -> Result<StopOutcome, SupervisorError> {
        let rx = {
            let runs = lock(&self.inner.runs);
            let entry = runs.get(&run_id).ok_or_else(|| SupervisorError::NotFound(format!("run {run_id}")))?;
            if entry.state.borrow().is_terminal() {
                return Ok(StopOutcome::AlreadyTerminal);
            }
            mark_stopping(&entry.state);
            entry.stop.cancel();
            entry.state.subscribe()
        };
        wait_terminal(rx).await;
        let (by_request, reason) = lock(&self.inner.runs)
            .get(&run_id)
            .map_or((false, None), |e| (e.stopped_by_request, e.reason));
        match (by_request, reason) {
            (true, Some(TerminalReason::ForcedTermination)) => {
                Err(SupervisorError::ForcedTermination(format!("run {run_id}")))
            }
            (true, _) => Ok(StopOutcome::Stopped),
            (false, _) => Ok(StopOutcome::AlreadyTerminal),
        }
    }

    /// Stops every active run concurrently. Returns the runs this call
    /// brought to a terminal state, sorted by id.
    pub async fn stop_all(&self) -> Vec<RunId> {
        let active: Vec<RunId> = lock(&self.inner.runs)
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
                Ok((id, Ok(StopOutcome::Stopped) | Err(SupervisorError::ForcedTermination(_)))) => stopped.push(id),
                Ok((_, Ok(StopOutcome::AlreadyTerminal))) => {}
                Ok((id, Err(e))) => tracing::warn!(run_id = %id, error = %e, "stop failed"),
                Err(e) => tracing::warn!(error = %e, "stop task failed"),
            }
        }
        stopped.sort();
        stopped
    }

    pub fn get(&self, run_id: RunId) -> Option<RunSnapshot> {
        let runs = lock(&self.inner.runs);
        runs.get(&run_id).map(|e| self.snapshot(run_id, e))
    }

    /// Every registered run, oldest first.
    pub fn list(&self) -> Vec<RunSnapshot> {
        let runs = lock(&self.inner.runs);
        let mut out: Vec<RunSnapshot> = runs.iter().map(|(id, e)| self.snapshot(*id, e)).collect();
        out.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        out
    }

    /// Forgets a terminal run and removes its artifacts.
    pub fn delete(&self, run_id: RunId) -> Result<(), SupervisorError> {
        {
            let mut runs = lock(&self.inner.runs);
            let entry = runs.get(&run_id).ok_or_else(|| SupervisorError::NotFound(format!("run {run_id}")))?;
            if entry.state.borrow().is_active() {
                return Err(SupervisorError::StillActive(format!("run {run_id}")));
            }
            runs.remove(&run_id);
        }
        self.inner.hub.remove(&run_id);
        self.inner.store.remove(&run_id).map_err(|e| SupervisorError::Storage(format!("{e:#}")))?;
        tracing::info!(%run_id, "run deleted");
        Ok(())
    }

    pub fn subscribe(&self, run_id: RunId) -> Result<Subscription, SupervisorError> {
        self.inner.hub.subscribe(&run_id).ok_or_else(|| SupervisorError::NotFound(format!("run {run_id}")))
    }

    /// Events retained for a run, in publish order.
    pub fn history(&self, run_id: RunId) -> Option<Vec<TelemetryEvent>> {
        self.inner.hub.history(&run_id)
    }

    /// Process teardown: stop everything still running.
    pub async fn shutdown(&self) -> Vec<RunId> {
        let stopped = self.stop_all().await;
        if !stopped.is_empty() {
            tracing::info!(count = stopped.len(), "stopped runs at shutdown");
        }
        stopped
    }

    fn snapshot(&self, run_id: RunId, e: &RunEntry) -> RunSnapshot {
        RunSnapshot {
            run_id,
            spec: e.spec.clone(),
            state: *e.state.borrow(),
            reason: e.reason,
            detail: e.detail.clone(),
            created_at: e.created_at.clone(),
            finished_at: e.finished_at.clone(),
            sent: e.counters.sent(),
            errors: e.counters.errors(),
            paths: self.inner.store.paths(&run_id),
            listen_addr: e.listen_addr,
        }
    }
}

impl Inner {
    async fn fail_start(&self, meta: RunMetadata, err: &SupervisorError) {
        tracing::warn!(run_id = %meta.run_id, error = %err, "run failed to start");
        let run_id = meta.run_id;
        self.hub.publish(&run_id, TelemetryEvent::error(err.to_string()));
        let reason = err.terminal_reason();
        let trace = self.store.paths(&run_id).trace;
        let summary = RunSummary {
            state: reason.terminal_state(),
            reason,
            detail: Some(err.to_string()),
            sent: 0,
            errors: 0,
            artifact: trace.is_file().then(|| trace.display().to_string()),
            result: None,
        };
        self.finalize(meta, summary).await;
    }

    /// Publishes `finished`, persists the record when the run directory
    /// exists, marks the run terminal and closes its channel.
    async fn finalize(&self, mut meta: RunMetadata, summary: RunSummary) {
        let run_id = meta.run_id;
        let finished_at = fuzzdeck_core::now_rfc3339();
        self.hub.publish(&run_id, TelemetryEvent::Finished { summary: summary.clone() });

        meta.state = summary.state;
        meta.reason = Some(summary.reason);
        meta.detail = summary.detail.clone();
        meta.finished_at = Some(finished_at.clone());
        meta.sent = summary.sent;
        meta.errors = summary.errors;
        if let Some(log) = self.hub.detach_log(&run_id) {
            tracing::debug!(%run_id, events = log.lines(), "event log closed");
        }
        if self.store.paths(&run_id).dir.is_dir() {
            let store = self.store.clone();
            let persisted = tokio::task::spawn_blocking(move || store.finish_run(&mut meta)).await;
            match persisted {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(%run_id, error = %format!("{e:#}"), "persisting run record"),
                Err(e) => tracing::error!(%run_id, error = %e, "persist task failed"),
            }
        }

        {
            let mut runs = lock(&self.runs);
            if let Some(entry) = runs.get_mut(&run_id) {
                entry.reason = Some(summary.reason);
                entry.detail = summary.detail.clone();
                entry.finished_at = Some(finished_at);
                entry.state.send_replace(summary.state);
            }
        }
        self.hub.close(&run_id);
        tracing::info!(
            %run_id,
            state = %summary.state,
            reason = %summary.reason,
            sent = summary.sent,
            errors = summary.errors,
            "run ended"
        );
    }

    fn begin_teardown(&self, run_id: RunId, by_request: bool) {
        if let Some(entry) = lock(&self.runs).get_mut(&run_id) {
            entry.stopped_by_request = by_request;
            mark_stopping(&entry.state);
        }
    }
}

enum Ending {
    Requested(TerminalReason),
    Exited(Result<(), EngineError>),
}

async fn supervise(
    inner: Arc<Inner>,
    meta: RunMetadata,
    mut engine: EngineHandle,
    sink: CaptureSink,
    counters: Arc<Counters>,
    stop: CancellationToken,
) {
    let run_id = meta.run_id;
    let limit = (meta.spec.duration_seconds > 0).then(|| Duration::from_secs(meta.spec.duration_seconds));
    let expiry = async move {
        match limit {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);
    let period = inner.config.heartbeat.max(MIN_HEARTBEAT);
    let mut beat = tokio::time::interval_at(Instant::now() + period, period);
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ending = loop {
        tokio::select! {
            _ = stop.cancelled() => break Ending::Requested(TerminalReason::Stopped),
            _ = &mut expiry => break Ending::Requested(TerminalReason::Expired),
            res = engine.wait() => break Ending::Exited(res),
            _ = beat.tick() => {
                inner.hub.publish(&run_id, counters.heartbeat());
            }
        }
    };
    inner.begin_teardown(run_id, matches!(ending, Ending::Requested(TerminalReason::Stopped)));

    let grace = inner.config.stop_grace;
    let (mut reason, mut detail) = match ending {
        Ending::Requested(reason) => match engine.stop(grace).await {
            Shutdown::Graceful(Ok(Ok(()))) => (reason, None),
            Shutdown::Graceful(Ok(Err(e))) => {
                tracing::warn!(%run_id, error = %e, "engine reported an error while stopping");
                (reason, Some(e.to_string()))
            }
            Shutdown::Graceful(Err(e)) => {
                inner.hub.publish(&run_id, TelemetryEvent::error(format!("engine task ended abnormally: {e}")));
                (TerminalReason::EngineFailure, Some(e.to_string()))
            }
            Shutdown::Forced => (
                TerminalReason::ForcedTermination,
                Some(format!("engine did not stop within {} ms", grace.as_millis())),
            ),
        },
        Ending::Exited(Ok(())) => (TerminalReason::Completed, None),
        Ending::Exited(Err(e)) => {
            inner.hub.publish(&run_id, TelemetryEvent::error(e.to_string()));
            (TerminalReason::EngineFailure, Some(e.to_string()))
        }
    };

    // Final counters, so even a run shorter than one heartbeat reports them.
    inner.hub.publish(&run_id, counters.heartbeat());

    let artifact = match close_capture(sink).await {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::error!(%run_id, error = %e, "closing capture");
            if !reason.is_failure() {
                reason = TerminalReason::StorageFailure;
                detail = Some(e.to_string());
            }
            None
        }
    };

    let summary = RunSummary {
        state: reason.terminal_state(),
        reason,
        detail,
        sent: counters.sent(),
        errors: counters.errors(),
        artifact,
        result: None,
    };
    inner.finalize(meta, summary).await;
}

/// Closes the sink off the runtime threads; the sniffer join and fsync block.
async fn close_capture(sink: CaptureSink) -> Result<String, SupervisorError> {
    match tokio::task::spawn_blocking(move || sink.close()).await {
        Ok(Ok(stats)) => Ok(stats.path.display().to_string()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(SupervisorError::Storage(format!("capture close task: {e}"))),
    }
}

/// Anything but loopback and private addresses counts as remote, as does
/// every host name except `localhost`.
pub fn is_remote_target(host: &str) -> bool {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => !(ip.is_loopback() || ip.is_private()),
        Ok(IpAddr::V6(ip)) => !(ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00),
        Err(_) => !host.eq_ignore_ascii_case("localhost"),
    }
}

async fn validate(spec: &RunSpec) -> Result<Prepared, SupervisorError> {
    let host = spec.target_ip.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(SupervisorError::Validation("target_ip is required".into()));
    }
    if spec.target_port == 0 {
        return Err(SupervisorError::Validation("target_port must be in 1-65535".into()));
    }
    if is_remote_target(host) && !spec.opt_bool("confirm_remote") {
        return Err(SupervisorError::Validation("remote target requires extra_opts.confirm_remote = true".into()));
    }
    let options = EngineOptions::from_spec(spec)?;
    let mut seeds = Vec::with_capacity(spec.seed_files.len());
    for path in &spec.seed_files {
        if !path.is_file() {
            return Err(SupervisorError::Validation(format!("seed file {} does not exist", path.display())));
        }
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SupervisorError::Validation(format!("reading seed {}: {e}", path.display())))?;
        seeds.push(bytes);
    }
    if !iface::interface_exists(&spec.interface) {
        return Err(SupervisorError::IfaceUnavailable(spec.interface.clone()));
    }
    let ip = port_scan::resolve(host).await.map_err(|e| SupervisorError::Validation(e.to_string()))?;
    Ok(Prepared { target: SocketAddr::new(ip, spec.target_port), seeds, options })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_targets() {
        assert!(!is_remote_target("127.0.0.1"));
        assert!(!is_remote_target("192.168.1.20"));
        assert!(!is_remote_target("10.1.2.3"));
        assert!(!is_remote_target("::1"));
        assert!(!is_remote_target("fd00::5"));
        assert!(!is_remote_target("LOCALHOST"));
        assert!(is_remote_target("8.8.8.8"));
        assert!(is_remote_target("2001:db8::1"));
        assert!(is_remote_target("dut.example.org"));
    }

    #[tokio::test]
    async fn validation_rejects_bad_requests() {
        use fuzzdeck_core::{EngineKind, Transport};
        let base = RunSpec::new("127.0.0.1", 9000, Transport::Udp, "lo", EngineKind::Mutation);

        let mut s = base.clone();
        s.target_ip = " ".into();
        assert!(matches!(validate(&s).await, Err(SupervisorError::Validation(_))));

        let mut s = base.clone();
        s.target_port = 0;
        assert!(matches!(validate(&s).await, Err(SupervisorError::Validation(_))));

        let mut s = base.clone();
        s.target_ip = "8.8.8.8".into();
        assert!(matches!(validate(&s).await, Err(SupervisorError::Validation(_))));

        let mut s = base.clone();
        s.seed_files.push("/definitely/not/a/seed.bin".into());
        assert!(matches!(validate(&s).await, Err(SupervisorError::Validation(_))));

        let mut s = base.clone();
        s.interface = "definitely-not-a-nic0".into();
        assert!(matches!(validate(&s).await, Err(SupervisorError::IfaceUnavailable(_))));
    }

    mod lifecycle {
        use super::*;
        use fuzzdeck_core::{EngineKind, Transport};
        use std::path::Path;
        use tokio::task::JoinHandle;

        fn config(dir: &Path, stop_grace: Duration) -> SupervisorConfig {
            SupervisorConfig {
                runs_dir: dir.join("runs"),
                heartbeat: Duration::from_millis(50),
                stop_grace,
                capture: capture::CaptureConfig { sniff: false, ..capture::CaptureConfig::default() },
                ..SupervisorConfig::default()
            }
        }

        fn spec() -> RunSpec {
            RunSpec::new("127.0.0.1", 9, Transport::Udp, "lo", EngineKind::Mutation)
        }

        fn handle(cancel: CancellationToken, task: JoinHandle<Result<(), EngineError>>) -> EngineHandle {
            EngineHandle::from_task(EngineKind::Mutation, cancel, task, None)
        }

        async fn terminal(sup: &RunSupervisor, id: RunId) -> RunSnapshot {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                let snap = sup.get(id).unwrap();
                if snap.state.is_terminal() {
                    return snap;
                }
                assert!(Instant::now() < deadline, "run {id} never ended");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        fn logged(paths: &RunPaths) -> Vec<TelemetryEvent> {
            std::fs::read_to_string(&paths.events)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }

        #[tokio::test]
        async fn engine_exit_completes_the_run_after_the_trace_is_closed() {
            let dir = tempfile::tempdir().unwrap();
            let sup = RunSupervisor::new(config(dir.path(), Duration::from_secs(1))).unwrap();
            let id = RunId::new();
            sup.launch(id, spec(), |ctx| async move {
                let cancel = ctx.cancel.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let src: SocketAddr = "127.0.0.1:4000".parse().unwrap();
                    ctx.recorder.record_payload(Transport::Udp, src, ctx.target, b"last");
                    ctx.counters.record_sent();
                    Ok(())
                });
                Ok(handle(cancel, task))
            })
            .await
            .unwrap();

            let snap = terminal(&sup, id).await;
            assert_eq!(snap.state, LifecycleState::Finished);
            assert_eq!(snap.reason, Some(TerminalReason::Completed));
            assert_eq!(snap.sent, 1);
            assert_eq!(capture::read_summary(&snap.paths.trace).unwrap().frames, 1);

            let meta = sup.store().load(&id).unwrap();
            assert_eq!(meta.reason, Some(TerminalReason::Completed));
            let events = logged(&snap.paths);
            let summary = match events.last() {
                Some(TelemetryEvent::Finished { summary }) => summary.clone(),
                other => panic!("log ends with {other:?}"),
            };
            assert!(summary.artifact.is_some());
            assert_eq!(sup.stop(id).await.unwrap(), StopOutcome::AlreadyTerminal);
        }

        #[tokio::test]
        async fn engine_error_fails_the_run() {
            let dir = tempfile::tempdir().unwrap();
            let sup = RunSupervisor::new(config(dir.path(), Duration::from_secs(1))).unwrap();
            let id = RunId::new();
            sup.launch(id, spec(), |ctx| async move {
                let cancel = ctx.cancel.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(EngineError::Failed("target reset the session".into()))
                });
                Ok(handle(cancel, task))
            })
            .await
            .unwrap();

            let snap = terminal(&sup, id).await;
            assert_eq!(snap.state, LifecycleState::Failed);
            assert_eq!(snap.reason, Some(TerminalReason::EngineFailure));
            assert!(snap.detail.unwrap().contains("target reset the session"));
            assert_eq!(capture::read_summary(&snap.paths.trace).unwrap().frames, 0);

            let events = logged(&snap.paths);
            assert!(events.iter().any(|e| matches!(e, TelemetryEvent::Error { .. })));
            assert!(events.last().unwrap().is_finished());
            assert_eq!(sup.store().load(&id).unwrap().state, LifecycleState::Failed);
        }

        #[tokio::test]
        async fn engine_ignoring_stop_is_forced() {
            let dir = tempfile::tempdir().unwrap();
            let sup = RunSupervisor::new(config(dir.path(), Duration::from_millis(200))).unwrap();
            let id = RunId::new();
            sup.launch(id, spec(), |ctx| async move {
                let task = tokio::spawn(std::future::pending::<Result<(), EngineError>>());
                Ok(handle(ctx.cancel.clone(), task))
            })
            .await
            .unwrap();

            let begun = Instant::now();
            let err = sup.stop(id).await.unwrap_err();
            assert!(matches!(err, SupervisorError::ForcedTermination(_)));
            assert!(begun.elapsed() < Duration::from_secs(5));

            let snap = sup.get(id).unwrap();
            assert_eq!(snap.state, LifecycleState::Failed);
            assert_eq!(snap.reason, Some(TerminalReason::ForcedTermination));
            assert_eq!(sup.store().load(&id).unwrap().reason, Some(TerminalReason::ForcedTermination));
            assert!(capture::read_summary(&snap.paths.trace).is_ok());
            assert!(sup.stop_all().await.is_empty());
        }

        #[tokio::test]
        async fn stop_while_pending_then_failed_start_is_not_a_stop() {
            let dir = tempfile::tempdir().unwrap();
            let sup = RunSupervisor::new(config(dir.path(), Duration::from_secs(1))).unwrap();
            let id = RunId::new();
            let starter = sup.clone();
            let start = tokio::spawn(async move {
                starter
                    .launch(id, spec(), |_ctx| async move {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Err::<EngineHandle, _>(EngineError::Spawn("mutator vanished".into()))
                    })
                    .await
            });

            let deadline = Instant::now() + Duration::from_secs(5);
            while sup.get(id).is_none() {
                assert!(Instant::now() < deadline, "run never registered");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let (one, all) = tokio::join!(sup.stop(id), sup.stop_all());
            assert_eq!(one.unwrap(), StopOutcome::AlreadyTerminal);
            assert!(all.is_empty());

            assert!(matches!(start.await.unwrap(), Err(SupervisorError::EngineSpawnFailure(_))));
            let snap = sup.get(id).unwrap();
            assert_eq!(snap.state, LifecycleState::Failed);
            assert_eq!(snap.reason, Some(TerminalReason::EngineSpawnFailure));
        }
    }
}
