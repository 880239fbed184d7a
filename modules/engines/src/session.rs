//! Stateful multi-step exchanges built from a field template.
//!
//! Each iteration mutates exactly one mutable field (fuzzable string or
//! delimiter) with one case from a fixed string-mutation library, walking
//! fields first and cases second, then plays every step of the template.

use crate::net::Conn;
use crate::{EngineContext, EngineError};
use fuzzdeck_core::throttle::Throttle;
use fuzzdeck_core::Transport;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often (in iterations) per-step progress is published after the first.
const PROGRESS_EVERY: u64 = 100;
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Static(String),
    Delim(String),
    Fuzz {
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl Field {
    fn bytes(&self) -> &[u8] {
        match self {
            Field::Static(s) | Field::Delim(s) => s.as_bytes(),
            Field::Fuzz { value, .. } => value.as_bytes(),
        }
    }

    fn is_mutable(&self) -> bool {
        !matches!(self, Field::Static(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStep {
    pub name: String,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTemplate {
    pub steps: Vec<SessionStep>,
}

impl Default for SessionTemplate {
    /// One HTTP request with a fuzzable path and Host header.
    fn default() -> Self {
        let fuzz = |value: &str, name: &str| Field::Fuzz { value: value.into(), name: Some(name.into()) };
        SessionTemplate {
            steps: vec![SessionStep {
                name: "http_req".into(),
                fields: vec![
                    Field::Static("GET".into()),
                    Field::Delim(" ".into()),
                    fuzz("/", "path"),
                    Field::Delim(" ".into()),
                    Field::Static("HTTP/1.1".into()),
                    Field::Delim("\r\n".into()),
                    Field::Static("Host: ".into()),
                    fuzz("dut", "hosthdr"),
                    Field::Delim("\r\n\r\n".into()),
                ],
            }],
        }
    }
}

impl SessionTemplate {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::InvalidOptions("session template has no steps".into()));
        }
        if let Some(step) = self.steps.iter().find(|s| s.fields.is_empty()) {
            return Err(EngineError::InvalidOptions(format!("session step '{}' has no fields", step.name)));
        }
        if self.mutable_fields().is_empty() {
            return Err(EngineError::InvalidOptions("session template has nothing to fuzz".into()));
        }
        Ok(())
    }

    /// `(step, field)` positions that can be mutated.
    pub fn mutable_fields(&self) -> Vec<(usize, usize)> {
        self.steps
            .iter()
            .enumerate()
            .flat_map(|(s, step)| {
                step.fields.iter().enumerate().filter(|(_, f)| f.is_mutable()).map(move |(i, _)| (s, i))
            })
            .collect()
    }

    /// Renders `step`, with the mutated bytes in place of their field when that
    /// field belongs to this step.
    pub fn render(&self, step: usize, mutated: Option<((usize, usize), &[u8])>) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, f) in self.steps[step].fields.iter().enumerate() {
            match mutated {
                Some(((s, fi), bytes)) if s == step && fi == i => out.extend_from_slice(bytes),
                _ => out.extend_from_slice(f.bytes()),
            }
        }
        out
    }

    fn field(&self, pos: (usize, usize)) -> &Field {
        &self.steps[pos.0].fields[pos.1]
    }
}

/// Number of cases [`string_case`] produces for any base value.
pub const STRING_CASES: usize = 20;

/// Case `n` (mod [`STRING_CASES`]) of the string-mutation library for `base`.
pub fn string_case(base: &[u8], n: usize) -> Vec<u8> {
    let long = |len: usize, b: u8| vec![b; len];
    let with = |suffix: &[u8]| [base, suffix].concat();
    match n % STRING_CASES {
        0 => Vec::new(),
        1 => long(128, b'A'),
        2 => long(255, b'A'),
        3 => long(256, b'A'),
        4 => long(1024, b'A'),
        5 => long(4096, b'A'),
        6 => long(65_000, b'A'),
        7 => with(b"%n%n%n%n%s%s%s%s"),
        8 => b"../../../../../../etc/passwd".to_vec(),
        9 => with(b"\x00"),
        10 => with(b"\r\nX-Injected: 1\r\n"),
        11 => with(b"\xc3\x28\xed\xa0\x80\xff\xfe"),
        12 => b"-1".to_vec(),
        13 => b"4294967296".to_vec(),
        14 => b"'\"><script>".to_vec(),
        15 => base.repeat(64),
        16 => with(&[0x7f; 16]),
        17 => b"%00".to_vec(),
        18 => base.iter().rev().copied().collect(),
        _ => long(512, b'\xff'),
    }
}

pub struct SessionEngine {
    template: SessionTemplate,
}

impl SessionEngine {
    pub(crate) fn prepare(ctx: &EngineContext) -> Result<Self, EngineError> {
        let template = ctx.options.session_template.clone().unwrap_or_default();
        template.validate()?;
        Ok(SessionEngine { template })
    }

    pub(crate) async fn run(self, ctx: EngineContext) -> Result<(), EngineError> {
        let link = ctx.link();
        let throttle = Throttle::from_millis(ctx.options.throttle_ms);
        let cancel = ctx.cancel.clone();
        let mut rng = StdRng::from_entropy();
        let positions = self.template.mutable_fields();
        let mut udp: Option<Conn> = None;
        let mut i: u64 = 0;

        while !cancel.is_cancelled() {
            let pos = positions[(i % positions.len() as u64) as usize];
            let case = (i / positions.len() as u64) as usize;
            let fuzzed = string_case(self.template.field(pos).bytes(), case);
            let report = i == 0 || i % PROGRESS_EVERY == 0;

            let exchange = async {
                let mut tcp = None;
                let conn = match ctx.transport {
                    Transport::Tcp => tcp.insert(link.open().await?),
                    Transport::Udp => match &mut udp {
                        Some(c) => c,
                        slot => slot.insert(link.open().await?),
                    },
                };
                for step in 0..self.template.steps.len() {
                    let msg = self.template.render(step, Some((pos, &fuzzed)));
                    let msg = ctx.options.anomaly_profile.apply(msg, &mut rng);
                    link.send(conn, &msg).await?;
                    let reply = link.recv(conn).await;
                    if report {
                        ctx.info(format!(
                            "iteration {i} step {} sent {} bytes, reply {} bytes",
                            self.template.steps[step].name,
                            msg.len(),
                            reply.as_ref().map_or(0, Vec::len),
                        ));
                    }
                }
                Ok::<(), std::io::Error>(())
            };
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                r = exchange => r,
            };
            match outcome {
                Ok(()) => ctx.counters.record_sent(),
                Err(e) => {
                    ctx.counters.record_error();
                    tracing::debug!(run_id = %ctx.run_id, error = %e, "session exchange failed");
                    udp = None;
                    if !Throttle::pause(ERROR_BACKOFF, &cancel).await {
                        break;
                    }
                }
            }

            i += 1;
            if !throttle.pace(&cancel).await {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzdeck_core::{EngineKind, EventSink, RunId, TelemetryEvent};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Collect(Mutex<Vec<TelemetryEvent>>);

    impl EventSink for Collect {
        fn emit(&self, event: TelemetryEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn default_template_renders_http() {
        let t = SessionTemplate::default();
        assert_eq!(t.render(0, None), b"GET / HTTP/1.1\r\nHost: dut\r\n\r\n");
        // four delimiters and two fuzzable strings
        assert_eq!(t.mutable_fields().len(), 6);
    }

    #[test]
    fn render_substitutes_one_field() {
        let t = SessionTemplate::default();
        let out = t.render(0, Some(((0, 2), b"/admin")));
        assert_eq!(out, b"GET /admin HTTP/1.1\r\nHost: dut\r\n\r\n");
    }

    #[test]
    fn template_parses_and_validates() {
        let t: SessionTemplate = serde_json::from_str(
            r#"{"steps":[{"name":"hello","fields":[{"static":"HELO "},{"fuzz":{"value":"me","name":"who"}},{"delim":"\r\n"}]}]}"#,
        )
        .unwrap();
        assert!(t.validate().is_ok());
        let only_static = SessionTemplate {
            steps: vec![SessionStep { name: "s".into(), fields: vec![Field::Static("x".into())] }],
        };
        assert!(only_static.validate().is_err());
        assert!(SessionTemplate { steps: vec![] }.validate().is_err());
    }

    #[test]
    fn string_cases_cycle() {
        assert_eq!(string_case(b"x", 0), b"");
        assert_eq!(string_case(b"x", STRING_CASES), b"");
        assert_eq!(string_case(b"ab", 18), b"ba");
    }

    #[tokio::test]
    async fn tcp_session_talks_to_server_and_reports_steps() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 70_000];
                    if let Ok(n) = s.read(&mut buf).await {
                        let _ = s.write_all(&buf[..n.min(16)]).await;
                    }
                });
            }
        });

        let sink = Arc::new(Collect::default());
        let mut ctx = EngineContext::new(RunId::new(), target, Transport::Tcp, "lo");
        ctx.options.throttle_ms = 0;
        ctx.events = sink.clone();
        let counters = ctx.counters.clone();
        let mut handle = crate::start(EngineKind::Session, ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.stop(Duration::from_secs(2)).await.is_forced());

        assert!(counters.sent() > 0);
        let events = sink.0.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, TelemetryEvent::Info { message } if message.contains("step http_req"))));
    }
}
