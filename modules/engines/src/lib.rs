//! Traffic-generation engines.
//!
//! The set of engines is closed: [`Engine`] has one variant per
//! [`EngineKind`]. [`start`] acquires whatever the engine needs (listener,
//! raw channel, mutator process) before returning, so acquisition failures
//! reach the caller synchronously; the send loop then runs as its own task
//! behind an [`EngineHandle`].

pub mod anomaly;
pub mod crafting;
pub mod mutation;
pub mod mutator;
pub(crate) mod net;
pub mod options;
pub mod relay;
pub mod session;

pub use anomaly::{Anomaly, AnomalyProfile};
pub use options::EngineOptions;

use capture::CaptureRecorder;
use fuzzdeck_core::shutdown::{stop_within, Shutdown};
use fuzzdeck_core::telemetry::NullSink;
use fuzzdeck_core::{Counters, EngineKind, EventSink, RunId, Transport};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine options: {0}")]
    InvalidOptions(String),
    /// The engine could not acquire what it needs to run.
    #[error("engine could not start: {0}")]
    Spawn(String),
    /// The engine stopped on its own because of an unrecoverable error.
    #[error("engine failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything an engine needs from the run that owns it.
pub struct EngineContext {
    pub run_id: RunId,
    pub target: SocketAddr,
    pub transport: Transport,
    pub interface: String,
    /// Seed payloads, already loaded. Engines cycle through them in order.
    pub seeds: Vec<Vec<u8>>,
    pub options: EngineOptions,
    pub counters: Arc<Counters>,
    pub events: Arc<dyn EventSink>,
    pub recorder: CaptureRecorder,
    pub cancel: CancellationToken,
    /// Resolved external mutator, if one was found.
    pub mutator_path: Option<PathBuf>,
}

impl EngineContext {
    pub fn new(run_id: RunId, target: SocketAddr, transport: Transport, interface: impl Into<String>) -> Self {
        EngineContext {
            run_id,
            target,
            transport,
            interface: interface.into(),
            seeds: Vec::new(),
            options: EngineOptions::default(),
            counters: Arc::new(Counters::default()),
            events: Arc::new(NullSink),
            recorder: CaptureRecorder::disabled(),
            cancel: CancellationToken::new(),
            mutator_path: None,
        }
    }

    pub(crate) fn link(&self) -> net::Link {
        net::Link {
            target: self.target,
            transport: self.transport,
            source: fuzzdeck_core::iface::first_ipv4(&self.interface).map(IpAddr::V4),
            io_timeout: self.options.io_timeout,
            reply_timeout: self.options.reply_timeout,
            recorder: self.recorder.clone(),
        }
    }

    pub(crate) fn info(&self, message: impl Into<String>) {
        self.events.emit(fuzzdeck_core::TelemetryEvent::info(message));
    }
}

pub enum Engine {
    Mutation(mutation::MutationEngine),
    Session(session::SessionEngine),
    Crafting(crafting::CraftingEngine),
    Relay(relay::RelayEngine),
}

impl Engine {
    pub async fn prepare(kind: EngineKind, ctx: &EngineContext) -> Result<Engine, EngineError> {
        Ok(match kind {
            EngineKind::Mutation => Engine::Mutation(mutation::MutationEngine::prepare(ctx).await?),
            EngineKind::Session => Engine::Session(session::SessionEngine::prepare(ctx)?),
            EngineKind::Crafting => Engine::Crafting(crafting::CraftingEngine::prepare(ctx)?),
            EngineKind::Relay => Engine::Relay(relay::RelayEngine::prepare(ctx).await?),
        })
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            Engine::Mutation(_) => EngineKind::Mutation,
            Engine::Session(_) => EngineKind::Session,
            Engine::Crafting(_) => EngineKind::Crafting,
            Engine::Relay(_) => EngineKind::Relay,
        }
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        match self {
            Engine::Relay(r) => r.local_addr(),
            _ => None,
        }
    }

    async fn run(self, ctx: EngineContext) -> Result<(), EngineError> {
        match self {
            Engine::Mutation(e) => e.run(ctx).await,
            Engine::Session(e) => e.run(ctx).await,
            Engine::Crafting(e) => e.run(ctx).await,
            Engine::Relay(e) => e.run(ctx).await,
        }
    }
}

pub struct EngineHandle {
    kind: EngineKind,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), EngineError>>,
    listen_addr: Option<SocketAddr>,
}

impl EngineHandle {
    /// Wraps an already spawned send loop that honours `cancel`.
    pub fn from_task(
        kind: EngineKind,
        cancel: CancellationToken,
        task: JoinHandle<Result<(), EngineError>>,
        listen_addr: Option<SocketAddr>,
    ) -> Self {
        EngineHandle { kind, cancel, task, listen_addr }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Where the relay accepts clients.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Resolves when the engine exits on its own. Must not be polled again
    /// after it resolved, and must not be followed by [`EngineHandle::stop`].
    pub async fn wait(&mut self) -> Result<(), EngineError> {
        match (&mut self.task).await {
            Ok(res) => res,
            Err(e) => Err(EngineError::Failed(format!("engine task ended abnormally: {e}"))),
        }
    }

    /// Cooperative stop, escalating to abort after `grace`.
    pub async fn stop(&mut self, grace: Duration) -> Shutdown<Result<(), EngineError>> {
        stop_within(&self.cancel, &mut self.task, grace).await
    }
}

/// Acquires the engine's resources and spawns its send loop.
pub async fn start(kind: EngineKind, ctx: EngineContext) -> Result<EngineHandle, EngineError> {
    let engine = Engine::prepare(kind, &ctx).await?;
    let listen_addr = engine.listen_addr();
    let cancel = ctx.cancel.clone();
    tracing::info!(run_id = %ctx.run_id, engine = %kind, target = %ctx.target, "engine started");
    let task = tokio::spawn(engine.run(ctx));
    Ok(EngineHandle::from_task(kind, cancel, task, listen_addr))
}

/// Seed payload for iteration `i`, or `fallback` with no seeds.
pub(crate) fn seed_at<'a>(seeds: &'a [Vec<u8>], i: u64, fallback: &'a [u8]) -> &'a [u8] {
    if seeds.is_empty() {
        fallback
    } else {
        &seeds[(i % seeds.len() as u64) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_rotate() {
        let seeds = vec![b"a".to_vec(), b"b".to_vec()];
        assert_eq!(seed_at(&seeds, 0, b"PING"), b"a");
        assert_eq!(seed_at(&seeds, 3, b"PING"), b"b");
        assert_eq!(seed_at(&[], 3, b"PING"), b"PING");
    }
}
