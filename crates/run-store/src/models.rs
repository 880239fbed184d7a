use fuzzdeck_core::{LifecycleState, RunId, RunSpec, TerminalReason};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

impl Default for ToolInfo {
    fn default() -> Self {
        ToolInfo { name: fuzzdeck_core::TOOL_NAME.to_string(), version: fuzzdeck_core::version().to_string() }
    }
}

/// Metadata record of one run: the start spec echoed back plus lifecycle
/// timestamps, counters and trace details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: RunId,
    pub spec: RunSpec,
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TerminalReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub sent: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceInfo>,
    #[serde(default)]
    pub tool: ToolInfo,
}

impl RunMetadata {
    pub fn new(run_id: RunId, spec: RunSpec) -> Self {
        RunMetadata {
            run_id,
            spec,
            state: LifecycleState::Pending,
            reason: None,
            detail: None,
            created_at: fuzzdeck_core::now_rfc3339(),
            finished_at: None,
            sent: 0,
            errors: 0,
            trace: None,
            tool: ToolInfo::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInfo {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}
