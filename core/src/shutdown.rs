//! Cooperative-then-forced stop, shared by run and scan supervision.

use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum Shutdown<T> {
    /// The task observed the signal and returned within the grace period.
    Graceful(Result<T, JoinError>),
    /// The grace period elapsed; the task was aborted.
    Forced,
}

impl<T> Shutdown<T> {
    pub fn is_forced(&self) -> bool {
        matches!(self, Shutdown::Forced)
    }
}

/// Signals `cancel`, waits up to `grace` for `task`, then aborts it.
pub async fn stop_within<T>(cancel: &CancellationToken, task: &mut JoinHandle<T>, grace: Duration) -> Shutdown<T> {
    cancel.cancel();
    match tokio::time::timeout(grace, &mut *task).await {
        Ok(res) => Shutdown::Graceful(res),
        Err(_) => {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "task ignored stop signal, aborting");
            task.abort();
            // Let the abort land so resources held by the task are dropped.
            let _ = task.await;
            Shutdown::Forced
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cooperative_task_stops_gracefully() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let mut task = tokio::spawn(async move {
            c.cancelled().await;
            7u32
        });
        match stop_within(&cancel, &mut task, Duration::from_secs(1)).await {
            Shutdown::Graceful(Ok(v)) => assert_eq!(v, 7),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn stubborn_task_is_forced() {
        let cancel = CancellationToken::new();
        let mut task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let out = stop_within(&cancel, &mut task, Duration::from_millis(50)).await;
        assert!(out.is_forced());
        assert!(task.is_finished());
    }
}
