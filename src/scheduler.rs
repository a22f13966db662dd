// src/scheduler.rs
//! Periodic per-source ticking.
//!
//! Each scheduled source gets its own ticker task. A tick runs the handler
//! inside [`guarded`], so an error or panic is logged and the next tick still
//! happens. Removing a source stops its ticker; a tick already in flight is
//! allowed to finish.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::boundary::guarded;
use crate::error::Result;
use crate::shutdown::Shutdown;
use crate::source::validate_schedule;

#[derive(Error, Debug, PartialEq)]
pub enum SchedulerError {
    #[error("scheduler is not running")]
    NotRunning,
    #[error("invalid schedule for source `{source_name}`: {reason}")]
    InvalidSchedule { source_name: String, reason: String },
    #[error("no scheduled job found for source `{0}`")]
    NotScheduled(String),
}

pub type TickFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type TickHandler = Arc<dyn Fn() -> TickFuture + Send + Sync>;

/// Wrap an async closure as a [`TickHandler`].
pub fn tick_handler<F, Fut>(f: F) -> TickHandler
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as TickFuture)
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ScheduleInfo {
    pub source_name: String,
    pub interval: Duration,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub is_scheduled: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SchedulerStats {
    pub is_running: bool,
    pub scheduled_jobs: usize,
    pub total_runs: u64,
}

#[derive(Debug, Default)]
struct TickState {
    next_run: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    run_count: u64,
}

struct Entry {
    interval: Duration,
    stop: Shutdown,
    state: Arc<Mutex<TickState>>,
    task: JoinHandle<()>,
}

impl Entry {
    fn info(&self, name: &str) -> ScheduleInfo {
        let st = self.state.lock().expect("tick state poisoned");
        ScheduleInfo {
            source_name: name.to_string(),
            interval: self.interval,
            next_run: st.next_run,
            last_run: st.last_run,
            run_count: st.run_count,
            is_scheduled: true,
        }
    }
}

pub struct JobScheduler {
    running: AtomicBool,
    jobs: RwLock<BTreeMap<String, Entry>>,
    /// Ticker tasks that were told to stop but may still be finishing a tick.
    retired: Mutex<Vec<JoinHandle<()>>>,
    root: Shutdown,
}

impl JobScheduler {
    pub fn new(root: Shutdown) -> Self {
        Self {
            running: AtomicBool::new(false),
            jobs: RwLock::new(BTreeMap::new()),
            retired: Mutex::new(Vec::new()),
            root,
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!(target: "scheduler", "scheduler is already running");
            return;
        }
        tracing::info!(target: "scheduler", "job scheduler started");
    }

    /// Stops every ticker and forgets all schedules.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!(target: "scheduler", "scheduler is not running");
            return;
        }
        let drained: Vec<Entry> = {
            let mut jobs = self.jobs.write().expect("scheduler lock poisoned");
            std::mem::take(&mut *jobs).into_values().collect()
        };
        for e in drained {
            self.retire(e);
        }
        tracing::info!(target: "scheduler", "job scheduler stopped");
    }

    /// `stop`, then wait up to `grace` for in-flight ticks to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop();
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.retired.lock().expect("scheduler lock poisoned"));
        let all = async {
            for h in handles {
                let _ = h.await;
            }
        };
        if tokio::time::timeout(grace, all).await.is_err() {
            tracing::warn!(target: "scheduler", ?grace, "in-flight ticks still running after grace period");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn retire(&self, e: Entry) {
        e.stop.trigger();
        let mut retired = self.retired.lock().expect("scheduler lock poisoned");
        retired.retain(|h| !h.is_finished());
        retired.push(e.task);
    }

    /// Start ticking `name` every `interval`, replacing any previous schedule
    /// for the same name. The first tick fires immediately.
    pub fn schedule_source(
        &self,
        name: &str,
        interval: Duration,
        handler: TickHandler,
    ) -> std::result::Result<(), SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }
        validate_schedule(interval).map_err(|e| SchedulerError::InvalidSchedule {
            source_name: name.to_string(),
            reason: e.to_string(),
        })?;

        let stop = Shutdown::new();
        let state = Arc::new(Mutex::new(TickState::default()));
        let task = tokio::spawn(run_ticker(
            name.to_string(),
            interval,
            handler,
            stop.clone(),
            self.root.clone(),
            state.clone(),
        ));
        let entry = Entry {
            interval,
            stop,
            state,
            task,
        };

        let previous = self
            .jobs
            .write()
            .expect("scheduler lock poisoned")
            .insert(name.to_string(), entry);
        if let Some(prev) = previous {
            tracing::debug!(target: "scheduler", source = %name, "replaced existing schedule");
            self.retire(prev);
        }
        tracing::info!(target: "scheduler", source = %name, ?interval, "source scheduled");
        Ok(())
    }

    pub fn remove_source(&self, name: &str) -> std::result::Result<(), SchedulerError> {
        let entry = self
            .jobs
            .write()
            .expect("scheduler lock poisoned")
            .remove(name)
            .ok_or_else(|| SchedulerError::NotScheduled(name.to_string()))?;
        self.retire(entry);
        tracing::info!(target: "scheduler", source = %name, "scheduled source removed");
        Ok(())
    }

    pub fn reschedule_source(
        &self,
        name: &str,
        interval: Duration,
        handler: TickHandler,
    ) -> std::result::Result<(), SchedulerError> {
        if let Err(e) = self.remove_source(name) {
            tracing::warn!(target: "scheduler", error = %e, source = %name, "failed to remove existing schedule during reschedule");
        }
        self.schedule_source(name, interval, handler)
    }

    pub fn schedule_info(&self, name: &str) -> std::result::Result<ScheduleInfo, SchedulerError> {
        self.jobs
            .read()
            .expect("scheduler lock poisoned")
            .get(name)
            .map(|e| e.info(name))
            .ok_or_else(|| SchedulerError::NotScheduled(name.to_string()))
    }

    pub fn all_schedule_info(&self) -> BTreeMap<String, ScheduleInfo> {
        self.jobs
            .read()
            .expect("scheduler lock poisoned")
            .iter()
            .map(|(n, e)| (n.clone(), e.info(n)))
            .collect()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().expect("scheduler lock poisoned").len()
    }

    pub fn stats(&self) -> SchedulerStats {
        let jobs = self.jobs.read().expect("scheduler lock poisoned");
        SchedulerStats {
            is_running: self.is_running(),
            scheduled_jobs: jobs.len(),
            total_runs: jobs
                .values()
                .map(|e| e.state.lock().expect("tick state poisoned").run_count)
                .sum(),
        }
    }
}

async fn run_ticker(
    name: String,
    interval: Duration,
    handler: TickHandler,
    stop: Shutdown,
    root: Shutdown,
    state: Arc<Mutex<TickState>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let next_of = |now: DateTime<Utc>| {
        chrono::Duration::from_std(interval)
            .ok()
            .map(|d| now + d)
    };
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = root.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Utc::now();
        {
            let mut st = state.lock().expect("tick state poisoned");
            st.last_run = Some(now);
            st.next_run = next_of(now);
            st.run_count += 1;
        }

        let t0 = Instant::now();
        tracing::debug!(target: "scheduler", source = %name, "starting scheduled collection");
        let res = guarded(&format!("tick:{name}"), handler()).await;
        histogram!("scheduler_tick_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        match res {
            Ok(()) => {
                tracing::debug!(target: "scheduler", source = %name, elapsed = ?t0.elapsed(), "scheduled collection completed");
            }
            Err(e) => {
                counter!("scheduler_tick_failures_total", "source" => name.clone()).increment(1);
                tracing::warn!(target: "scheduler", error = %e, source = %name, "scheduled collection failed");
            }
        }
    }
    tracing::debug!(target: "scheduler", source = %name, "ticker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: Arc<AtomicUsize>) -> TickHandler {
        tick_handler(move || {
            let c = counter.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn schedule_requires_running_and_valid_interval() {
        let s = JobScheduler::new(Shutdown::new());
        let h = counting(Arc::new(AtomicUsize::new(0)));
        assert_eq!(
            s.schedule_source("a", Duration::from_secs(60), h.clone()),
            Err(SchedulerError::NotRunning)
        );
        s.start();
        assert!(matches!(
            s.schedule_source("a", Duration::from_secs(10), h.clone()),
            Err(SchedulerError::InvalidSchedule { .. })
        ));
        assert!(s.schedule_source("a", Duration::from_secs(30), h).is_ok());
        assert_eq!(s.job_count(), 1);
        assert!(matches!(s.remove_source("nope"), Err(SchedulerError::NotScheduled(_))));
        s.stop();
        assert_eq!(s.job_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_immediately_then_every_interval() {
        let s = JobScheduler::new(Shutdown::new());
        s.start();
        let n = Arc::new(AtomicUsize::new(0));
        s.schedule_source("a", Duration::from_secs(60), counting(n.clone()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(n.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(n.load(Ordering::SeqCst), 3);
        let info = s.schedule_info("a").unwrap();
        assert_eq!(info.run_count, 3);
        assert!(info.last_run.is_some() && info.next_run > info.last_run);
        assert_eq!(s.stats().total_runs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_and_panicking_ticks_do_not_stop_ticker() {
        let s = JobScheduler::new(Shutdown::new());
        s.start();
        let n = Arc::new(AtomicUsize::new(0));
        let n2 = n.clone();
        s.schedule_source(
            "flaky",
            Duration::from_secs(30),
            tick_handler(move || {
                let n = n2.clone();
                async move {
                    match n.fetch_add(1, Ordering::SeqCst) {
                        0 => Err(PipelineError::process("first tick fails")),
                        1 => panic!("second tick panics"),
                        _ => Ok(()),
                    }
                }
            }),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(n.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_previous_ticker() {
        let s = JobScheduler::new(Shutdown::new());
        s.start();
        let old = Arc::new(AtomicUsize::new(0));
        let new = Arc::new(AtomicUsize::new(0));
        s.schedule_source("a", Duration::from_secs(30), counting(old.clone()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        s.reschedule_source("a", Duration::from_secs(60), counting(new.clone()))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(old.load(Ordering::SeqCst), 1);
        assert_eq!(new.load(Ordering::SeqCst), 2);
        assert_eq!(s.schedule_info("a").unwrap().interval, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn root_shutdown_stops_tickers() {
        let root = Shutdown::new();
        let s = JobScheduler::new(root.clone());
        s.start();
        let n = Arc::new(AtomicUsize::new(0));
        s.schedule_source("a", Duration::from_secs(30), counting(n.clone()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        root.trigger();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(n.load(Ordering::SeqCst), 1);
    }
}
