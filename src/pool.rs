// src/pool.rs
//! Bounded worker pool shared by the collection and processing stages.
//!
//! Admission is non-blocking: a job is accepted only while fewer than
//! `queue_size` jobs are queued or running, otherwise the caller gets
//! `QueueFull` straight away. `stop` closes ingress, lets the workers drain
//! whatever is queued and waits for them. Once the root [`Shutdown`] fires,
//! workers stop picking up jobs and whatever is still queued is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use metrics::{counter, gauge, histogram};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::boundary::guarded;
use crate::error::{PipelineError, Result};
use crate::shutdown::Shutdown;

/// Something a pool can run.
pub trait Job: Send + 'static {
    fn id(&self) -> &str;
    /// Checked before enqueue; an invalid job never reaches a worker.
    fn validate(&self) -> Result<()>;
}

#[async_trait::async_trait]
pub trait JobHandler<J: Job>: Send + Sync + 'static {
    async fn handle(&self, job: J) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub name: &'static str,
    pub worker_count: usize,
    pub queue_size: usize,
    /// Emit Prometheus series; the atomic stats are kept either way.
    pub metrics_enabled: bool,
}

/// Immutable snapshot of [`PoolMetrics`].
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct PoolStats {
    pub worker_count: usize,
    pub queue_size: usize,
    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub rejected_jobs: u64,
    pub average_job_time: Duration,
    pub active_workers: usize,
    pub queued: usize,
    pub pending: usize,
}

impl PoolStats {
    /// Fraction of admission capacity in use, 0.0..=1.0.
    pub fn utilization(&self) -> f64 {
        if self.queue_size == 0 {
            return 0.0;
        }
        self.pending as f64 / self.queue_size as f64
    }
}

#[derive(Debug, Default)]
pub struct PoolMetrics {
    total: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    total_nanos: AtomicU64,
    active: AtomicUsize,
    /// queued + running
    pending: AtomicUsize,
}

impl PoolMetrics {
    fn try_reserve(&self, capacity: usize) -> bool {
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                (p < capacity).then_some(p + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn finished(&self, elapsed: Duration, ok: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        if ok {
            self.ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub struct WorkerPool<J: Job> {
    cfg: PoolConfig,
    tx: Sender<J>,
    rx: Receiver<J>,
    accepting: AtomicBool,
    metrics: Arc<PoolMetrics>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Shutdown,
}

impl<J: Job> WorkerPool<J> {
    pub fn new(cfg: PoolConfig, shutdown: Shutdown) -> Self {
        let cap = cfg.queue_size.max(1);
        let (tx, rx) = async_channel::bounded(cap);
        Self {
            cfg: PoolConfig {
                worker_count: cfg.worker_count.max(1),
                queue_size: cap,
                ..cfg
            },
            tx,
            rx,
            accepting: AtomicBool::new(false),
            metrics: Arc::new(PoolMetrics::default()),
            workers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn name(&self) -> &'static str {
        self.cfg.name
    }

    /// Spawn the workers. Calling it twice is a no-op.
    pub fn start(&self, handler: Arc<dyn JobHandler<J>>) {
        let mut workers = self.workers.lock().expect("pool lock poisoned");
        if !workers.is_empty() || self.tx.is_closed() {
            tracing::warn!(pool = self.cfg.name, "worker pool already started or stopped");
            return;
        }
        for id in 0..self.cfg.worker_count {
            workers.push(tokio::spawn(worker_loop(
                id,
                self.cfg,
                self.rx.clone(),
                handler.clone(),
                self.metrics.clone(),
                self.shutdown.clone(),
            )));
        }
        self.accepting.store(true, Ordering::SeqCst);
        tracing::info!(
            pool = self.cfg.name,
            workers = self.cfg.worker_count,
            queue_size = self.cfg.queue_size,
            "worker pool started"
        );
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn reject(&self, reason: &'static str) {
        self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
        if self.cfg.metrics_enabled {
            counter!("pool_rejected_total", "pool" => self.cfg.name, "reason" => reason).increment(1);
        }
    }

    /// Validate and enqueue without waiting.
    pub fn submit(&self, job: J) -> Result<()> {
        if let Err(e) = job.validate() {
            self.reject("invalid");
            return Err(e);
        }
        if !self.is_accepting() || self.shutdown.is_triggered() {
            self.reject("closed");
            return Err(PipelineError::PoolClosed(self.cfg.name));
        }
        if !self.metrics.try_reserve(self.cfg.queue_size) {
            self.reject("full");
            return Err(PipelineError::QueueFull {
                pool: self.cfg.name,
                capacity: self.cfg.queue_size,
            });
        }
        match self.tx.try_send(job) {
            Ok(()) => {
                if self.cfg.metrics_enabled {
                    gauge!("pool_pending", "pool" => self.cfg.name)
                        .set(self.metrics.pending.load(Ordering::Relaxed) as f64);
                }
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.release();
                self.reject("full");
                Err(PipelineError::QueueFull {
                    pool: self.cfg.name,
                    capacity: self.cfg.queue_size,
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.release();
                self.reject("closed");
                Err(PipelineError::PoolClosed(self.cfg.name))
            }
        }
    }

    /// Stop accepting, drain the queue and wait for every worker. After a
    /// root shutdown the workers have already quit and leftovers are dropped.
    pub async fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.tx.close();
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().expect("pool lock poisoned"));
        if handles.is_empty() {
            return;
        }
        for h in handles {
            if let Err(e) = h.await {
                tracing::error!(pool = self.cfg.name, error = ?e, "worker task ended abnormally");
            }
        }
        let mut dropped = 0usize;
        while self.rx.try_recv().is_ok() {
            self.metrics.release();
            dropped += 1;
        }
        if dropped > 0 {
            tracing::warn!(pool = self.cfg.name, dropped, "queued jobs dropped on shutdown");
        }
        tracing::info!(pool = self.cfg.name, "worker pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let m = &self.metrics;
        let total = m.total.load(Ordering::Relaxed);
        let avg = if total == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(m.total_nanos.load(Ordering::Relaxed) / total)
        };
        PoolStats {
            worker_count: self.cfg.worker_count,
            queue_size: self.cfg.queue_size,
            total_jobs: total,
            successful_jobs: m.ok.load(Ordering::Relaxed),
            failed_jobs: m.failed.load(Ordering::Relaxed),
            rejected_jobs: m.rejected.load(Ordering::Relaxed),
            average_job_time: avg,
            active_workers: m.active.load(Ordering::Relaxed),
            queued: self.tx.len(),
            pending: m.pending.load(Ordering::Relaxed),
        }
    }
}

async fn worker_loop<J: Job>(
    id: usize,
    cfg: PoolConfig,
    rx: Receiver<J>,
    handler: Arc<dyn JobHandler<J>>,
    metrics: Arc<PoolMetrics>,
    shutdown: Shutdown,
) {
    let pool = cfg.name;
    tracing::debug!(pool, worker = id, "worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::debug!(pool, worker = id, "shutdown signalled");
                break;
            }
            // recv fails only once the channel is closed and empty
            next = rx.recv() => match next {
                Ok(job) => job,
                Err(_) => break,
            },
        };
        let active = metrics.active.fetch_add(1, Ordering::SeqCst) + 1;
        if cfg.metrics_enabled {
            gauge!("pool_active_workers", "pool" => pool).set(active as f64);
        }

        let job_id = job.id().to_string();
        let h = handler.clone();
        let t0 = Instant::now();
        let res = guarded(&format!("{pool}:{job_id}"), async move { h.handle(job).await }).await;
        let elapsed = t0.elapsed();

        metrics.finished(elapsed, res.is_ok());
        metrics.release();
        let active = metrics.active.fetch_sub(1, Ordering::SeqCst) - 1;
        if cfg.metrics_enabled {
            let outcome = if res.is_ok() { "ok" } else { "error" };
            gauge!("pool_active_workers", "pool" => pool).set(active as f64);
            histogram!("pool_job_ms", "pool" => pool).record(elapsed.as_secs_f64() * 1_000.0);
            counter!("pool_jobs_total", "pool" => pool, "outcome" => outcome).increment(1);
        }
        if let Err(e) = res {
            tracing::warn!(pool, worker = id, job = %job_id, error = %e, "job failed");
        }
    }
    tracing::debug!(pool, worker = id, "worker exiting");
}
