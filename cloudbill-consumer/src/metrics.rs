//! Consumer-wide counters, logged periodically by the binary (spec §6/§7:
//! "consumer errors are ... aggregated into per-resource-type counters").
//! Mirrors `original_source/mq_consumer/consumer.py::ConsumerMetrics`.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    pub messages_received: AtomicU64,
    pub messages_processed: AtomicU64,
    pub messages_failed: AtomicU64,
    pub messages_requeued: AtomicU64,
    pub batches_processed: AtomicU64,
    start_time_epoch_ms: AtomicI64,
    last_message_time: RwLock<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub messages_requeued: u64,
    pub batches_processed: u64,
    pub uptime_seconds: f64,
    pub messages_per_second: f64,
}

impl ConsumerMetrics {
    pub fn mark_started(&self, at: DateTime<Utc>) {
        self.start_time_epoch_ms.store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub async fn mark_received(&self, at: DateTime<Utc>) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        *self.last_message_time.write().await = Some(at);
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let processed = self.messages_processed.load(Ordering::Relaxed);
        let start_ms = self.start_time_epoch_ms.load(Ordering::Relaxed);
        let uptime_seconds = if start_ms == 0 {
            0.0
        } else {
            (now.timestamp_millis() - start_ms).max(0) as f64 / 1000.0
        };
        let messages_per_second = if uptime_seconds > 0.0 { processed as f64 / uptime_seconds } else { 0.0 };

        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_processed: processed,
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_requeued: self.messages_requeued.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            uptime_seconds,
            messages_per_second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reports_zero_rate_before_start() {
        let metrics = ConsumerMetrics::default();
        let snap = metrics.snapshot(Utc::now()).await;
        assert_eq!(snap.messages_per_second, 0.0);
    }
}
