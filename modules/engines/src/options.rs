use crate::anomaly::AnomalyProfile;
use crate::session::SessionTemplate;
use crate::EngineError;
use fuzzdeck_core::RunSpec;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_THROTTLE_MS: u64 = 10;
pub const DEFAULT_PROXY_HOST: &str = "0.0.0.0";
pub const DEFAULT_PROXY_PORT: u16 = 8888;

/// Engine tuning read out of a run's `extra_opts`. Keys the engines do not
/// know (`confirm_remote`, `instances`, ...) are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub throttle_ms: u64,
    pub anomaly_profile: AnomalyProfile,
    pub proxy_bind_host: String,
    pub proxy_bind_port: u16,
    pub io_timeout: Duration,
    pub reply_timeout: Duration,
    pub require_external_mutator: bool,
    pub session_template: Option<SessionTemplate>,
}

#[derive(Deserialize)]
struct RawOptions {
    throttle_ms: Option<u64>,
    #[serde(default)]
    anomaly_profile: AnomalyProfile,
    proxy_bind_host: Option<String>,
    proxy_bind_port: Option<u16>,
    #[serde(default = "default_io_timeout")]
    io_timeout_ms: u64,
    #[serde(default = "default_reply_timeout")]
    reply_timeout_ms: u64,
    #[serde(default)]
    require_external_mutator: bool,
    session_template: Option<SessionTemplate>,
}

fn default_io_timeout() -> u64 {
    2000
}

fn default_reply_timeout() -> u64 {
    200
}

impl EngineOptions {
    /// A top-level `throttle_ms` on the `RunSpec` wins over the one in `extra_opts`.
    pub fn from_spec(spec: &RunSpec) -> Result<Self, EngineError> {
        let raw: RawOptions = serde_json::from_value(serde_json::Value::Object(spec.extra_opts.clone()))
            .map_err(|e| EngineError::InvalidOptions(e.to_string()))?;
        if raw.io_timeout_ms == 0 {
            return Err(EngineError::InvalidOptions("io_timeout_ms must be > 0".into()));
        }
        if let Some(t) = &raw.session_template {
            t.validate()?;
        }
        Ok(EngineOptions {
            throttle_ms: spec.throttle_ms.or(raw.throttle_ms).unwrap_or(DEFAULT_THROTTLE_MS),
            anomaly_profile: raw.anomaly_profile,
            proxy_bind_host: raw.proxy_bind_host.unwrap_or_else(|| DEFAULT_PROXY_HOST.to_string()),
            proxy_bind_port: raw.proxy_bind_port.unwrap_or(DEFAULT_PROXY_PORT),
            io_timeout: Duration::from_millis(raw.io_timeout_ms),
            reply_timeout: Duration::from_millis(raw.reply_timeout_ms.min(raw.io_timeout_ms)),
            require_external_mutator: raw.require_external_mutator,
            session_template: raw.session_template,
        })
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            throttle_ms: DEFAULT_THROTTLE_MS,
            anomaly_profile: AnomalyProfile::default(),
            proxy_bind_host: DEFAULT_PROXY_HOST.to_string(),
            proxy_bind_port: DEFAULT_PROXY_PORT,
            io_timeout: Duration::from_millis(default_io_timeout()),
            reply_timeout: Duration::from_millis(default_reply_timeout()),
            require_external_mutator: false,
            session_template: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::Anomaly;
    use fuzzdeck_core::{EngineKind, Transport};
    use serde_json::json;

    fn spec_with(opts: serde_json::Value) -> RunSpec {
        let mut spec = RunSpec::new("127.0.0.1", 9001, Transport::Tcp, "lo", EngineKind::Relay);
        spec.extra_opts = opts.as_object().cloned().unwrap_or_default();
        spec
    }

    #[test]
    fn defaults_apply() {
        let o = EngineOptions::from_spec(&spec_with(json!({ "confirm_remote": true }))).unwrap();
        assert_eq!(o, EngineOptions::default());
    }

    #[test]
    fn spec_throttle_overrides_extra_opts() {
        let mut spec = spec_with(json!({ "throttle_ms": 50 }));
        assert_eq!(EngineOptions::from_spec(&spec).unwrap().throttle_ms, 50);
        spec.throttle_ms = Some(0);
        assert_eq!(EngineOptions::from_spec(&spec).unwrap().throttle_ms, 0);
    }

    #[test]
    fn parses_proxy_and_profile() {
        let o = EngineOptions::from_spec(&spec_with(json!({
            "proxy_bind_host": "127.0.0.1",
            "proxy_bind_port": 9999,
            "anomaly_profile": { "special_chars": 2 },
            "io_timeout_ms": 100,
        })))
        .unwrap();
        assert_eq!(o.proxy_bind_host, "127.0.0.1");
        assert_eq!(o.proxy_bind_port, 9999);
        assert_eq!(o.anomaly_profile, AnomalyProfile::new([(Anomaly::SpecialChars, 2)]));
        assert_eq!(o.reply_timeout, Duration::from_millis(100));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(EngineOptions::from_spec(&spec_with(json!({ "proxy_bind_port": 70000 }))).is_err());
        assert!(EngineOptions::from_spec(&spec_with(json!({ "io_timeout_ms": 0 }))).is_err());
        assert!(EngineOptions::from_spec(&spec_with(json!({ "anomaly_profile": { "nope": 1 } }))).is_err());
    }
}
