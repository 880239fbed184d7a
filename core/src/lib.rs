//! Core vocabulary shared by the fuzzdeck crates: lifecycle ids and states,
//! reason codes, telemetry events, pacing and the two-phase stop primitive.

pub mod iface;
pub mod model;
pub mod shutdown;
pub mod telemetry;
pub mod throttle;
pub mod tools;

pub use model::{
    EngineKind, LifecycleState, ParseKindError, RunId, RunSpec, ScanId, ScanMethod, ScanSpec,
    TerminalReason, Transport,
};
pub use telemetry::{Counters, EventSink, RunSummary, TelemetryEvent};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const TOOL_NAME: &str = "fuzzdeck";

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Current UTC time as an RFC 3339 string, empty if formatting fails.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }

    #[test]
    fn timestamps_are_rfc3339() {
        let ts = now_rfc3339();
        assert!(OffsetDateTime::parse(&ts, &Rfc3339).is_ok());
    }
}
