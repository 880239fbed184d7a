use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Minimum spacing between sends. A zero interval still yields to the
/// scheduler so an unthrottled loop stays cancellable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    interval: Duration,
}

impl Throttle {
    pub fn from_millis(ms: u64) -> Self {
        Throttle { interval: Duration::from_millis(ms) }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_unthrottled(&self) -> bool {
        self.interval.is_zero()
    }

    /// Waits one interval. Returns `false` once `cancel` fires, so loops read
    /// `while throttle.pace(&cancel).await { ... }`.
    pub async fn pace(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if self.interval.is_zero() {
            tokio::task::yield_now().await;
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.interval) => true,
        }
    }

    /// Like [`Throttle::pace`] but for an arbitrary pause (error backoff).
    pub async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn pace_waits_for_interval() {
        let t = Throttle::from_millis(30);
        let cancel = CancellationToken::new();
        let started = Instant::now();
        assert!(t.pace(&cancel).await);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn pace_returns_early_on_cancel() {
        let t = Throttle::from_millis(10_000);
        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c2.cancel();
        });
        let started = Instant::now();
        assert!(!t.pace(&cancel).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unthrottled_still_observes_cancel() {
        let t = Throttle::from_millis(0);
        assert!(t.is_unthrottled());
        let cancel = CancellationToken::new();
        assert!(t.pace(&cancel).await);
        cancel.cancel();
        assert!(!t.pace(&cancel).await);
    }
}
