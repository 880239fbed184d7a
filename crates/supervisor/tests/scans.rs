use fuzzdeck_core::{LifecycleState, ScanMethod, ScanSpec, TelemetryEvent, TerminalReason};
use std::net::TcpListener;
use std::time::Duration;
use supervisor::{ScanSupervisor, StopOutcome, SupervisorConfig, SupervisorError};

fn supervisor() -> ScanSupervisor {
    ScanSupervisor::new(SupervisorConfig { stop_grace: Duration::from_secs(2), ..SupervisorConfig::default() })
}

async fn wait_terminal(sup: &ScanSupervisor, id: fuzzdeck_core::ScanId) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while sup.get(id).unwrap().state.is_active() {
        assert!(tokio::time::Instant::now() < deadline, "scan did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn builtin_scan_finds_exactly_the_open_port() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let open = listener.local_addr().unwrap().port();
    let ports = format!("{}-{}", open.saturating_sub(5).max(1), open.saturating_add(5));
    let sup = supervisor();
    let id = sup.start(ScanSpec::builtin("127.0.0.1", ports)).unwrap();
    let mut sub = sup.subscribe(id).unwrap();

    let mut saw_finished = false;
    while let Some(ev) = sub.next().await {
        saw_finished |= ev.is_finished();
    }
    assert!(saw_finished);

    let result = sup.result(id).unwrap().expect("finished scan has a result");
    assert_eq!(result.tcp_open, vec![open]);
    assert!(result.udp_maybe_open.is_empty());
    assert_eq!(result.method, ScanMethod::Builtin);
    let snap = sup.get(id).unwrap();
    assert_eq!(snap.state, LifecycleState::Finished);
    assert_eq!(snap.reason, Some(TerminalReason::Completed));
    assert!(sup.history(id).unwrap().iter().any(|e| matches!(e, TelemetryEvent::Info { .. })));
}

#[tokio::test]
async fn stopped_scan_keeps_partial_result() {
    let sup = supervisor();
    let mut spec = ScanSpec::builtin("127.0.0.1", "1-65535");
    spec.tcp = false;
    spec.udp = true;
    spec.timeout_ms = 2_000;
    let id = sup.start(spec).unwrap();
    assert_eq!(sup.result(id).unwrap(), None);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sup.stop(id).await.unwrap(), StopOutcome::Stopped);
    let snap = sup.get(id).unwrap();
    assert_eq!(snap.state, LifecycleState::Finished);
    assert_eq!(snap.reason, Some(TerminalReason::Stopped));
    assert!(sup.result(id).unwrap().is_some());
    assert_eq!(sup.stop(id).await.unwrap(), StopOutcome::AlreadyTerminal);

    sup.delete(id).unwrap();
    assert!(matches!(sup.result(id), Err(SupervisorError::NotFound(_))));
}

#[cfg(unix)]
#[tokio::test]
async fn nmap_output_is_used_when_the_binary_resolves() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    let fake = dir.path().join("nmap");
    std::fs::write(
        &fake,
        "#!/bin/sh\necho 'Host: 127.0.0.1 ()\tPorts: 22/open/tcp//ssh///, 161/open|filtered/udp//snmp///'\n",
    )
    .unwrap();
    std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

    let sup = ScanSupervisor::new(SupervisorConfig { nmap: Some(fake), ..SupervisorConfig::default() });
    let mut spec = ScanSpec::builtin("127.0.0.1", "22,161");
    spec.method = ScanMethod::Nmap;
    spec.udp = true;
    let id = sup.start(spec).unwrap();
    wait_terminal(&sup, id).await;

    let result = sup.result(id).unwrap().unwrap();
    assert_eq!(result.method, ScanMethod::Nmap);
    assert_eq!(result.tcp_open, vec![22]);
    assert_eq!(result.udp_maybe_open, vec![161]);
}

#[cfg(unix)]
#[tokio::test]
async fn shutdown_stops_stubborn_scans_together() {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap();
    let fake = dir.path().join("nmap");
    std::fs::write(&fake, "#!/bin/sh\ntrap '' TERM\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

    let sup = ScanSupervisor::new(SupervisorConfig {
        nmap: Some(fake),
        stop_grace: Duration::from_millis(800),
        ..SupervisorConfig::default()
    });
    let mut ids = Vec::new();
    for _ in 0..3 {
        let mut spec = ScanSpec::builtin("127.0.0.1", "22");
        spec.method = ScanMethod::Nmap;
        ids.push(sup.start(spec).unwrap());
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let begun = std::time::Instant::now();
    let stopped = sup.shutdown().await;
    let took = begun.elapsed();
    ids.sort();
    assert_eq!(stopped, ids);
    assert!(took < Duration::from_secs(2), "shutdown took {took:?}");
    assert!(sup.list().iter().all(|s| s.state.is_terminal()));
    assert!(sup.shutdown().await.is_empty());
}

#[tokio::test]
async fn failing_scan_has_no_result() {
    let sup = supervisor();
    let id = sup.start(ScanSpec::builtin("no-such-host.invalid", "80")).unwrap();
    wait_terminal(&sup, id).await;
    let snap = sup.get(id).unwrap();
    assert_eq!(snap.state, LifecycleState::Failed);
    assert_eq!(snap.reason, Some(TerminalReason::ScanFailure));
    assert_eq!(sup.result(id).unwrap(), None);
    assert!(sup.history(id).unwrap().iter().any(|e| matches!(e, TelemetryEvent::Error { .. })));
}

#[test]
fn invalid_scans_are_rejected() {
    let sup = supervisor();
    let mut both = ScanSpec::builtin("127.0.0.1", "80");
    both.top_ports = Some(10);
    assert!(matches!(sup.start(both), Err(SupervisorError::Validation(_))));
    let mut none = ScanSpec::builtin("127.0.0.1", "80");
    none.tcp = false;
    assert!(matches!(sup.start(none), Err(SupervisorError::Validation(_))));
    assert!(sup.list().is_empty());
}
