// src/source/throttle.rs
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum spacing between requests to one source.
///
/// `rate_limit` is requests per second; zero (or less) disables throttling.
#[derive(Debug)]
pub struct Throttle {
    spacing: Option<Duration>,
    next_slot: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn per_second(rate_limit: f64) -> Self {
        let spacing = (rate_limit.is_finite() && rate_limit > 0.0)
            .then(|| Duration::from_secs_f64(1.0 / rate_limit));
        Self {
            spacing,
            next_slot: Mutex::new(None),
        }
    }

    pub fn spacing(&self) -> Option<Duration> {
        self.spacing
    }

    /// Waits for the next free slot and reserves the one after it.
    pub async fn wait(&self) {
        let Some(spacing) = self.spacing else {
            return;
        };
        let mut slot = self.next_slot.lock().await;
        let now = Instant::now();
        let start = match *slot {
            Some(at) if at > now => {
                tokio::time::sleep_until(at).await;
                at
            }
            _ => now,
        };
        *slot = Some(start + spacing);
    }
}
