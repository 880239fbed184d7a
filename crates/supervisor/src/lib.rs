//! Supervision of fuzzing runs and port scans.
//!
//! Every run or scan is one lifecycle driven by its own tokio task. The
//! registries only hold snapshots and control handles, and their locks are
//! never held across an `.await`.

pub mod config;
pub mod error;
pub mod hub;
pub mod runs;
pub mod scans;

pub use config::SupervisorConfig;
pub use error::SupervisorError;
pub use hub::{ChannelPublisher, Subscription, TelemetryHub};
pub use runs::{RunPlan, RunSnapshot, RunSupervisor, StopOutcome};
pub use scans::{ScanResult, ScanSnapshot, ScanSupervisor};

use fuzzdeck_core::LifecycleState;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Locks a registry, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Moves an active lifecycle to `stopping`. Terminal states stay put.
pub(crate) fn mark_stopping(state: &watch::Sender<LifecycleState>) {
    state.send_if_modified(|s| {
        if s.is_active() && *s != LifecycleState::Stopping {
            *s = LifecycleState::Stopping;
            true
        } else {
            false
        }
    });
}

/// Moves `pending` to `running`; a stop that arrived first wins.
pub(crate) fn mark_running(state: &watch::Sender<LifecycleState>) {
    state.send_if_modified(|s| {
        if *s == LifecycleState::Pending {
            *s = LifecycleState::Running;
            true
        } else {
            false
        }
    });
}

/// Resolves once the watched lifecycle is terminal.
pub(crate) async fn wait_terminal(mut rx: watch::Receiver<LifecycleState>) {
    let _ = rx.wait_for(|s| s.is_terminal()).await;
}
