// src/shutdown.rs
use tokio::sync::watch;

/// Root cancellation signal. Cloned into the scheduler, both pools, backoff
/// sleeps and the retry relay; triggering any clone stops all of them.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        // send_replace never fails, even with no live receivers
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `trigger` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Err means every sender is gone, which we also treat as shutdown.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `dur` unless shutdown fires first. Returns `false` when
    /// interrupted.
    pub async fn sleep(&self, dur: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(dur) => true,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_reaches_every_clone() {
        let root = Shutdown::new();
        let child = root.clone();
        assert!(!child.is_triggered());

        let waiter = tokio::spawn(async move {
            child.cancelled().await;
        });
        root.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert!(root.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_interrupted_by_shutdown() {
        let s = Shutdown::new();
        let s2 = s.clone();
        let h = tokio::spawn(async move { s2.sleep(Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        s.trigger();
        assert!(!h.await.unwrap());
    }
}
