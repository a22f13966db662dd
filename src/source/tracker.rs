// src/source/tracker.rs
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Point-in-time view of a source's fetch history.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SourceStats {
    pub total_fetches: u64,
    pub successful_fetches: u64,
    pub failed_fetches: u64,
    pub items_collected: u64,
    pub average_response: Duration,
    pub last_fetch: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub uptime_percentage: f64,
}

#[derive(Debug)]
struct Health {
    last_fetch: Option<DateTime<Utc>>,
    last_fetch_at: Option<Instant>,
    last_error: Option<String>,
    uptime: f64,
    avg_response: Duration,
}

/// Counters are atomics; timestamps, last error and the smoothed uptime sit
/// behind one mutex that is only held for a few assignments.
#[derive(Debug)]
pub struct SourceTracker {
    enabled: bool,
    total: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
    items: AtomicU64,
    health: Mutex<Health>,
}

impl SourceTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            total: AtomicU64::new(0),
            ok: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            items: AtomicU64::new(0),
            health: Mutex::new(Health {
                last_fetch: None,
                last_fetch_at: None,
                last_error: None,
                uptime: 100.0,
                avg_response: Duration::ZERO,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn record(&self, elapsed: Duration, error: Option<&str>) {
        let n = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        let mut h = self.health.lock().expect("tracker mutex poisoned");
        // running mean over all fetches
        let prev = h.avg_response.as_secs_f64();
        let mean = prev + (elapsed.as_secs_f64() - prev) / n as f64;
        h.avg_response = Duration::from_secs_f64(mean.max(0.0));
        h.last_fetch = Some(Utc::now());
        h.last_fetch_at = Some(Instant::now());
        match error {
            None => {
                h.uptime = h.uptime * 0.9 + 10.0;
                h.last_error = None;
            }
            Some(e) => {
                h.uptime *= 0.9;
                h.last_error = Some(e.to_string());
            }
        }
    }

    pub fn record_success(&self, elapsed: Duration, items: usize) {
        self.ok.fetch_add(1, Ordering::Relaxed);
        self.items.fetch_add(items as u64, Ordering::Relaxed);
        self.record(elapsed, None);
    }

    pub fn record_failure(&self, elapsed: Duration, reason: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record(elapsed, Some(reason));
    }

    /// Disabled sources are unhealthy, as is one whose last fetch failed
    /// less than two schedule intervals ago.
    pub fn is_healthy(&self, schedule: Duration) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let h = self.health.lock().expect("tracker mutex poisoned");
        match (&h.last_error, h.last_fetch_at) {
            (Some(_), Some(at)) => at.elapsed() >= schedule * 2,
            _ => true,
        }
    }

    pub fn snapshot(&self) -> SourceStats {
        let h = self.health.lock().expect("tracker mutex poisoned");
        SourceStats {
            total_fetches: self.total.load(Ordering::Relaxed),
            successful_fetches: self.ok.load(Ordering::Relaxed),
            failed_fetches: self.failed.load(Ordering::Relaxed),
            items_collected: self.items.load(Ordering::Relaxed),
            average_response: h.avg_response,
            last_fetch: h.last_fetch,
            last_error: h.last_error.clone(),
            uptime_percentage: h.uptime,
        }
    }
}
