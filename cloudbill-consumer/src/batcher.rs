//! Groups deliveries into fixed-size (or timeout-flushed) batches and
//! processes each batch with bounded concurrency, so a burst of messages
//! doesn't open one handler task per delivery. Grounded on
//! `original_source/mq_consumer/consumer.py`'s `MessageBatcher`.

use crate::handler::{EventHandler, MessageOutcome};
use crate::metrics::ConsumerMetrics;
use lapin::{message::Delivery, options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions}};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Duration;
use tracing::{error, warn};

pub struct MessageBatcher {
    batch_size: usize,
    concurrency: Arc<Semaphore>,
    pending: Arc<Mutex<Vec<(Delivery, Value)>>>,
    handler: Arc<EventHandler>,
    metrics: Arc<ConsumerMetrics>,
}

impl MessageBatcher {
    pub fn new(batch_size: usize, batch_concurrency: usize, handler: Arc<EventHandler>, metrics: Arc<ConsumerMetrics>) -> Self {
        Self {
            batch_size,
            concurrency: Arc::new(Semaphore::new(batch_concurrency)),
            pending: Arc::new(Mutex::new(Vec::new())),
            handler,
            metrics,
        }
    }

    /// Spawns the periodic flush task: batches that never reach `batch_size`
    /// still drain within `batch_timeout`, so low-traffic queues don't stall.
    pub fn spawn_flush_loop(self: &Arc<Self>, batch_timeout: Duration) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(batch_timeout);
            loop {
                ticker.tick().await;
                this.flush().await;
            }
        })
    }

    pub async fn add(&self, delivery: Delivery, body: Value) {
        let should_flush = {
            let mut pending = self.pending.lock().await;
            pending.push((delivery, body));
            pending.len() >= self.batch_size
        };
        if should_flush {
            self.flush().await;
        }
    }

    pub async fn flush(&self) {
        let batch = {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };
        self.process_batch(batch).await;
        self.metrics.batches_processed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    async fn process_batch(&self, batch: Vec<(Delivery, Value)>) {
        let mut tasks = Vec::with_capacity(batch.len());
        for (delivery, body) in batch {
            let permit = Arc::clone(&self.concurrency).acquire_owned().await.expect("semaphore closed");
            let handler = Arc::clone(&self.handler);
            let metrics = Arc::clone(&self.metrics);
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = handler.process_message(&body).await;
                ack_delivery(&delivery, outcome, &metrics).await;
            }));
        }
        for task in tasks {
            if let Err(err) = task.await {
                error!(%err, "batch message task panicked");
            }
        }
    }

    /// Blocks until every in-flight handler task has released its permit.
    /// Used during graceful shutdown to drain work already admitted before
    /// closing the broker channel.
    pub async fn wait_idle(&self, concurrency: usize) {
        let _ = self.concurrency.acquire_many(concurrency as u32).await;
    }
}

async fn ack_delivery(delivery: &Delivery, outcome: MessageOutcome, metrics: &Arc<ConsumerMetrics>) {
    use std::sync::atomic::Ordering;
    match outcome {
        MessageOutcome::Ack => {
            metrics.messages_processed.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                warn!(%err, "failed to ack delivery");
            }
        }
        MessageOutcome::NackRequeue => {
            metrics.messages_failed.fetch_add(1, Ordering::Relaxed);
            metrics.messages_requeued.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await {
                warn!(%err, "failed to nack delivery");
            }
        }
        MessageOutcome::RejectNoRequeue => {
            metrics.messages_failed.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = delivery.reject(BasicRejectOptions { requeue: false }).await {
                warn!(%err, "failed to reject delivery");
            }
        }
    }
}
