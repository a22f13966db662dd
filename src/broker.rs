// src/broker.rs
//! Message broker seam plus an in-process implementation.
//!
//! Routing keys double as queue names (`news.raw`, `news.retry`, ...).
//! Consumers on the same queue compete for messages.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_channel::{Receiver, Sender};
use metrics::counter;

use crate::error::PipelineError;
use crate::model::NewsMessage;
use crate::shutdown::Shutdown;

#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// `Ok` acks. `QueueFull` asks for redelivery later; `PoolClosed` and
    /// `Cancelled` requeue and end the subscription; anything else drops.
    async fn handle(&self, body: &[u8]) -> crate::error::Result<()>;
}

#[async_trait::async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, route: &str, msg: &NewsMessage) -> Result<()>;
    /// Start delivering `queue` to `handler` in the background.
    async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

struct Queue {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    log: HashMap<String, Vec<NewsMessage>>,
    failing: HashSet<String>,
}

/// In-process broker with a per-route publish log for inspection.
pub struct InMemoryBroker {
    state: Mutex<State>,
    closed: Shutdown,
    requeue_delay: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_requeue_delay(Duration::from_millis(100))
    }

    pub fn with_requeue_delay(requeue_delay: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            closed: Shutdown::new(),
            requeue_delay,
        }
    }

    fn queue_handles(&self, route: &str) -> (Sender<Vec<u8>>, Receiver<Vec<u8>>) {
        let mut st = self.state.lock().expect("broker lock poisoned");
        let q = st.queues.entry(route.to_string()).or_insert_with(Queue::new);
        (q.tx.clone(), q.rx.clone())
    }

    /// Make every publish on `route` fail (or succeed again).
    pub fn set_fail_publish(&self, route: &str, fail: bool) {
        let mut st = self.state.lock().expect("broker lock poisoned");
        if fail {
            st.failing.insert(route.to_string());
        } else {
            st.failing.remove(route);
        }
    }

    /// Push an arbitrary body onto a queue, bypassing encoding.
    pub fn publish_raw(&self, route: &str, body: Vec<u8>) -> Result<()> {
        if self.closed.is_triggered() {
            return Err(anyhow!("broker is closed"));
        }
        let (tx, _) = self.queue_handles(route);
        tx.try_send(body)
            .map_err(|e| anyhow!("enqueue on {route} failed: {e}"))
    }

    /// Every message successfully published on `route`, oldest first.
    pub fn published(&self, route: &str) -> Vec<NewsMessage> {
        self.state
            .lock()
            .expect("broker lock poisoned")
            .log
            .get(route)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages sitting in `route` waiting for a consumer.
    pub fn pending(&self, route: &str) -> usize {
        self.state
            .lock()
            .expect("broker lock poisoned")
            .queues
            .get(route)
            .map(|q| q.rx.len())
            .unwrap_or(0)
    }

    /// Polls the publish log until `route` holds at least `count` messages.
    pub async fn wait_for_published(&self, route: &str, count: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if self.published(route).len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait::async_trait]
impl MessageQueue for InMemoryBroker {
    async fn publish(&self, route: &str, msg: &NewsMessage) -> Result<()> {
        if self.closed.is_triggered() {
            return Err(anyhow!("broker is closed"));
        }
        let body = msg.to_bytes()?;
        let tx = {
            let mut st = self.state.lock().expect("broker lock poisoned");
            if st.failing.contains(route) {
                return Err(anyhow!("publish to {route} rejected"));
            }
            st.log.entry(route.to_string()).or_default().push(msg.clone());
            st.queues
                .entry(route.to_string())
                .or_insert_with(Queue::new)
                .tx
                .clone()
        };
        tx.try_send(body)
            .map_err(|e| anyhow!("enqueue on {route} failed: {e}"))?;
        counter!("broker_published_total", "route" => route.to_string()).increment(1);
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.closed.is_triggered() {
            return Err(anyhow!("broker is closed"));
        }
        let (tx, rx) = self.queue_handles(queue);
        let closed = self.closed.clone();
        let delay = self.requeue_delay;
        let name = queue.to_string();
        let queue = name.clone();
        tokio::spawn(async move {
            loop {
                let body = tokio::select! {
                    biased;
                    _ = closed.cancelled() => break,
                    next = rx.recv() => match next {
                        Ok(b) => b,
                        Err(_) => break,
                    },
                };
                match handler.handle(&body).await {
                    Ok(()) => {}
                    Err(e) if e.is_backpressure() => {
                        counter!("broker_requeued_total", "queue" => queue.clone()).increment(1);
                        tracing::debug!(queue = %queue, error = %e, "nack, requeue");
                        let still_open = closed.sleep(delay).await;
                        let _ = tx.try_send(body);
                        if !still_open {
                            break;
                        }
                    }
                    Err(e @ (PipelineError::PoolClosed(_) | PipelineError::Cancelled)) => {
                        let _ = tx.try_send(body);
                        tracing::info!(queue = %queue, reason = %e, "consumer stopping");
                        break;
                    }
                    Err(e) => {
                        counter!("broker_dropped_total", "queue" => queue.clone()).increment(1);
                        tracing::warn!(queue = %queue, error = %e, "message rejected, dropping");
                    }
                }
            }
            tracing::debug!(queue = %queue, "consumer ended");
        });
        tracing::info!(queue = %name, "consumer attached");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.trigger();
        tracing::info!("broker closed");
        Ok(())
    }
}
