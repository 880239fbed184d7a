use crate::model::{LifecycleState, TerminalReason};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// One event on a run or scan telemetry channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TelemetryEvent {
    Heartbeat { sent: u64, errors: u64 },
    Info { message: String },
    Error { message: String },
    Finished { summary: RunSummary },
}

impl TelemetryEvent {
    pub fn info(message: impl Into<String>) -> Self {
        TelemetryEvent::Info { message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TelemetryEvent::Error { message: message.into() }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TelemetryEvent::Finished { .. })
    }
}

/// Terminal summary carried by the `finished` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub state: LifecycleState,
    pub reason: TerminalReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub sent: u64,
    pub errors: u64,
    /// Artifact path (trace file for runs) when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Free-form result payload (scan results).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Send/error counters shared between an engine and its supervisor.
#[derive(Debug, Default)]
pub struct Counters {
    sent: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn heartbeat(&self) -> TelemetryEvent {
        TelemetryEvent::Heartbeat { sent: self.sent(), errors: self.errors() }
    }
}

/// Where engines and scanners report telemetry. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Sink that discards everything; used when no channel is attached.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: TelemetryEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let hb = TelemetryEvent::Heartbeat { sent: 3, errors: 1 };
        assert_eq!(serde_json::to_string(&hb).unwrap(), r#"{"type":"heartbeat","sent":3,"errors":1}"#);
        let info: TelemetryEvent = serde_json::from_str(r#"{"type":"info","message":"hi"}"#).unwrap();
        assert_eq!(info, TelemetryEvent::info("hi"));
    }

    #[test]
    fn counters_feed_heartbeats() {
        let c = Counters::default();
        c.record_sent();
        c.record_sent();
        c.record_error();
        assert_eq!(c.heartbeat(), TelemetryEvent::Heartbeat { sent: 2, errors: 1 });
    }
}
