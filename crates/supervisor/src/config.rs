use capture::CaptureConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub runs_dir: PathBuf,
    /// Cadence of `heartbeat` events on run channels.
    pub heartbeat: Duration,
    /// How long a cooperative stop may take before work is aborted.
    pub stop_grace: Duration,
    /// Per-subscriber backlog before oldest events are dropped.
    pub telemetry_capacity: usize,
    /// Events kept in memory per channel for `history`; `events.jsonl` is uncapped.
    pub telemetry_history: usize,
    pub capture: CaptureConfig,
    pub radamsa: Option<PathBuf>,
    pub nmap: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            runs_dir: PathBuf::from("runs"),
            heartbeat: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
            telemetry_capacity: 256,
            telemetry_history: 10_000,
            capture: CaptureConfig::default(),
            radamsa: None,
            nmap: None,
        }
    }
}
