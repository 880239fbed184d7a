use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("unknown {what} '{value}' (expected one of: {expected})")]
pub struct ParseKindError {
    pub what: &'static str,
    pub value: String,
    pub expected: &'static str,
}

macro_rules! lifecycle_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Allocates a fresh, time-ordered identifier.
            pub fn new() -> Self {
                $name(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map($name)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                $name(id)
            }
        }
    };
}

lifecycle_id!(
    /// Identifier of one supervised fuzzing run.
    RunId
);
lifecycle_id!(
    /// Identifier of one supervised port-discovery job.
    ScanId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = ParseKindError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(ParseKindError { what: "transport", value: other.into(), expected: "tcp, udp" }),
        }
    }
}

/// The closed set of traffic-generation strategies a run can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Seed bytes through an external (or builtin) byte mutator.
    Mutation,
    /// Stateful multi-step exchange with field-level mutation.
    Session,
    /// Programmatically crafted IP packets with fuzzed header fields.
    Crafting,
    /// Local listener relaying to the DUT, mutating in both directions.
    Relay,
}

impl EngineKind {
    pub const ALL: [EngineKind; 4] =
        [EngineKind::Mutation, EngineKind::Session, EngineKind::Crafting, EngineKind::Relay];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Mutation => "mutation",
            EngineKind::Session => "session",
            EngineKind::Crafting => "crafting",
            EngineKind::Relay => "relay",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = ParseKindError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept the names of the tools that historically backed each engine.
        match s.trim().to_ascii_lowercase().as_str() {
            "mutation" | "radamsa" => Ok(EngineKind::Mutation),
            "session" | "boofuzz" => Ok(EngineKind::Session),
            "crafting" | "custom" => Ok(EngineKind::Crafting),
            "relay" | "proxy" => Ok(EngineKind::Relay),
            other => Err(ParseKindError {
                what: "engine",
                value: other.into(),
                expected: "mutation, session, crafting, relay",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMethod {
    Nmap,
    Builtin,
}

impl ScanMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMethod::Nmap => "nmap",
            ScanMethod::Builtin => "builtin",
        }
    }
}

impl fmt::Display for ScanMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMethod {
    type Err = ParseKindError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nmap" => Ok(ScanMethod::Nmap),
            "builtin" | "auto" => Ok(ScanMethod::Builtin),
            other => Err(ParseKindError { what: "scan method", value: other.into(), expected: "nmap, builtin" }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Pending,
    Running,
    Stopping,
    Finished,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Finished | LifecycleState::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Finished => "finished",
            LifecycleState::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run or scan reached its terminal state. The serialized form is the
/// stable reason code operators and evidence tooling match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// The engine or scan ran to its natural end.
    Completed,
    /// An operator asked for the stop.
    Stopped,
    /// The duration bound elapsed.
    Expired,
    IfaceUnavailable,
    PermissionDenied,
    EngineSpawnFailure,
    EngineFailure,
    ScanFailure,
    StorageFailure,
    /// Graceful stop timed out and the work was aborted.
    ForcedTermination,
}

impl TerminalReason {
    pub fn code(&self) -> &'static str {
        match self {
            TerminalReason::Completed => "completed",
            TerminalReason::Stopped => "stopped",
            TerminalReason::Expired => "expired",
            TerminalReason::IfaceUnavailable => "iface_unavailable",
            TerminalReason::PermissionDenied => "permission_denied",
            TerminalReason::EngineSpawnFailure => "engine_spawn_failure",
            TerminalReason::EngineFailure => "engine_failure",
            TerminalReason::ScanFailure => "scan_failure",
            TerminalReason::StorageFailure => "storage_failure",
            TerminalReason::ForcedTermination => "forced_termination",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, TerminalReason::Completed | TerminalReason::Stopped | TerminalReason::Expired)
    }

    /// Terminal state a lifecycle ending for this reason lands in.
    pub fn terminal_state(&self) -> LifecycleState {
        if self.is_failure() {
            LifecycleState::Failed
        } else {
            LifecycleState::Finished
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Request to start one fuzzing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub target_ip: String,
    pub target_port: u16,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    pub interface: String,
    /// Wall-clock bound in seconds; 0 runs until stopped.
    #[serde(default)]
    pub duration_seconds: u64,
    pub engine: EngineKind,
    /// Minimum delay between sends; falls back to `extra_opts.throttle_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_ms: Option<u64>,
    #[serde(default)]
    pub seed_files: Vec<PathBuf>,
    #[serde(default)]
    pub extra_opts: serde_json::Map<String, serde_json::Value>,
}

fn default_transport() -> Transport {
    Transport::Tcp
}

impl RunSpec {
    pub fn new(target_ip: impl Into<String>, target_port: u16, transport: Transport, interface: impl Into<String>, engine: EngineKind) -> Self {
        RunSpec {
            target_ip: target_ip.into(),
            target_port,
            transport,
            interface: interface.into(),
            duration_seconds: 0,
            engine,
            throttle_ms: None,
            seed_files: Vec::new(),
            extra_opts: serde_json::Map::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        if self.target_ip.contains(':') && !self.target_ip.starts_with('[') {
            format!("[{}]:{}", self.target_ip, self.target_port)
        } else {
            format!("{}:{}", self.target_ip, self.target_port)
        }
    }

    pub fn opt_bool(&self, key: &str) -> bool {
        self.extra_opts.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }
}

/// Request to start one port-discovery job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSpec {
    pub target: String,
    #[serde(default = "default_method")]
    pub method: ScanMethod,
    #[serde(default = "default_true")]
    pub tcp: bool,
    #[serde(default)]
    pub udp: bool,
    /// Comma/range list such as `22,80,1000-2000`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_ports: Option<usize>,
    #[serde(default = "default_scan_timeout")]
    pub timeout_ms: u64,
}

fn default_method() -> ScanMethod {
    ScanMethod::Builtin
}

fn default_true() -> bool {
    true
}

fn default_scan_timeout() -> u64 {
    300
}

impl ScanSpec {
    pub fn builtin(target: impl Into<String>, ports: impl Into<String>) -> Self {
        ScanSpec {
            target: target.into(),
            method: ScanMethod::Builtin,
            tcp: true,
            udp: false,
            ports: Some(ports.into()),
            top_ports: None,
            timeout_ms: default_scan_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_parse_back() {
        let a = RunId::new();
        let b = RunId::new();
        assert_ne!(a, b);
        let parsed: RunId = a.to_string().parse().unwrap();
        assert_eq!(parsed, a);
        assert!("not-a-uuid".parse::<ScanId>().is_err());
    }

    #[test]
    fn engine_aliases() {
        assert_eq!("radamsa".parse::<EngineKind>().unwrap(), EngineKind::Mutation);
        assert_eq!("PROXY".parse::<EngineKind>().unwrap(), EngineKind::Relay);
        assert!("afl".parse::<EngineKind>().is_err());
    }

    #[test]
    fn reasons_map_to_states() {
        assert_eq!(TerminalReason::Stopped.terminal_state(), LifecycleState::Finished);
        assert_eq!(TerminalReason::Expired.terminal_state(), LifecycleState::Finished);
        assert_eq!(TerminalReason::ForcedTermination.terminal_state(), LifecycleState::Failed);
        assert_eq!(
            serde_json::to_string(&TerminalReason::EngineSpawnFailure).unwrap(),
            "\"engine_spawn_failure\""
        );
    }

    #[test]
    fn run_spec_defaults() {
        let spec: RunSpec = serde_json::from_str(
            r#"{"target_ip":"127.0.0.1","target_port":9001,"interface":"lo","engine":"mutation"}"#,
        )
        .unwrap();
        assert_eq!(spec.transport, Transport::Tcp);
        assert_eq!(spec.duration_seconds, 0);
        assert!(spec.seed_files.is_empty());
        assert_eq!(spec.endpoint(), "127.0.0.1:9001");
    }

    #[test]
    fn ipv6_endpoint_is_bracketed() {
        let spec = RunSpec::new("::1", 80, Transport::Udp, "lo", EngineKind::Relay);
        assert_eq!(spec.endpoint(), "[::1]:80");
    }
}
