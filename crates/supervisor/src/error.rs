use capture::CaptureError;
use engines::EngineError;
use fuzzdeck_core::TerminalReason;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} is already registered")]
    Duplicate(String),
    #[error("{0} is still active")]
    StillActive(String),
    #[error("interface {0} is not available")]
    IfaceUnavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("engine could not start: {0}")]
    EngineSpawnFailure(String),
    /// The lifecycle ended, but only after its work was aborted.
    #[error("{0} ignored the stop request and was aborted")]
    ForcedTermination(String),
    #[error("artifact storage failed: {0}")]
    Storage(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SupervisorError {
    /// Stable code callers can match on.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::Validation(_) => "validation_error",
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::Duplicate(_) => "duplicate",
            SupervisorError::StillActive(_) => "still_active",
            SupervisorError::IfaceUnavailable(_) => TerminalReason::IfaceUnavailable.code(),
            SupervisorError::PermissionDenied(_) => TerminalReason::PermissionDenied.code(),
            SupervisorError::EngineSpawnFailure(_) => TerminalReason::EngineSpawnFailure.code(),
            SupervisorError::ForcedTermination(_) => TerminalReason::ForcedTermination.code(),
            SupervisorError::Storage(_) => TerminalReason::StorageFailure.code(),
            SupervisorError::Io(_) => "io_error",
        }
    }

    /// Reason a run is recorded with when this error ends it.
    pub fn terminal_reason(&self) -> TerminalReason {
        match self {
            SupervisorError::IfaceUnavailable(_) => TerminalReason::IfaceUnavailable,
            SupervisorError::PermissionDenied(_) => TerminalReason::PermissionDenied,
            SupervisorError::EngineSpawnFailure(_) => TerminalReason::EngineSpawnFailure,
            SupervisorError::ForcedTermination(_) => TerminalReason::ForcedTermination,
            _ => TerminalReason::StorageFailure,
        }
    }
}

impl From<CaptureError> for SupervisorError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::IfaceUnavailable { iface } => SupervisorError::IfaceUnavailable(iface),
            e @ CaptureError::PermissionDenied { .. } => SupervisorError::PermissionDenied(e.to_string()),
            CaptureError::Io(e) => SupervisorError::Storage(e.to_string()),
        }
    }
}

impl From<EngineError> for SupervisorError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidOptions(msg) => SupervisorError::Validation(msg),
            EngineError::Spawn(msg) | EngineError::Failed(msg) => SupervisorError::EngineSpawnFailure(msg),
            EngineError::Io(e) => SupervisorError::EngineSpawnFailure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_errors_map_to_reasons() {
        let e: SupervisorError = CaptureError::IfaceUnavailable { iface: "eth9".into() }.into();
        assert_eq!(e.code(), "iface_unavailable");
        assert_eq!(e.terminal_reason(), TerminalReason::IfaceUnavailable);
        let e: SupervisorError = CaptureError::PermissionDenied {
            iface: "eth0".into(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        }
        .into();
        assert_eq!(e.terminal_reason(), TerminalReason::PermissionDenied);
    }

    #[test]
    fn engine_errors_map_to_spawn_failure() {
        let e: SupervisorError = EngineError::Spawn("raw channel".into()).into();
        assert_eq!(e.code(), "engine_spawn_failure");
        let e: SupervisorError = EngineError::InvalidOptions("bad".into()).into();
        assert_eq!(e.code(), "validation_error");
    }
}
