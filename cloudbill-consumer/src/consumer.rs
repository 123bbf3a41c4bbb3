//! AMQP 0-9-1 connection/channel lifecycle: topic exchange, durable queue
//! with a dead-letter binding, QoS prefetch, and the main consume loop with
//! graceful shutdown. Grounded on
//! `original_source/mq_consumer/consumer.py::EventConsumer`, translated from
//! `pika` onto `lapin`'s tokio-native client (no synchronous AMQP client
//! exists in the pack; see SPEC_FULL.md §13).

use crate::batcher::MessageBatcher;
use crate::config::MqConfig;
use crate::handler::{EventHandler, MessageOutcome};
use crate::metrics::ConsumerMetrics;
use cloudbill_errors::ConsumerError;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

pub struct MqConsumer {
    config: MqConfig,
    handler: Arc<EventHandler>,
    use_batching: bool,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl MqConsumer {
    pub fn new(config: MqConfig, handler: Arc<EventHandler>, use_batching: bool) -> Self {
        Self { config, handler, use_batching, connection: None, channel: None }
    }

    pub async fn connect(&mut self) -> Result<(), ConsumerError> {
        let options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect(&self.config.url(), options)
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;
        let channel = connection.create_channel().await.map_err(|e| ConsumerError::Broker(e.to_string()))?;

        channel
            .exchange_declare(
                &self.config.exchange_name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        let dlq_name = self.config.dlq_name();
        channel
            .queue_declare(&dlq_name, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        let mut queue_args = FieldTable::default();
        queue_args.insert("x-dead-letter-exchange".into(), lapin::types::AMQPValue::LongString("".into()));
        queue_args.insert("x-dead-letter-routing-key".into(), lapin::types::AMQPValue::LongString(dlq_name.clone().into()));

        channel
            .queue_declare(&self.config.queue_name, QueueDeclareOptions { durable: true, ..Default::default() }, queue_args)
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        channel
            .queue_bind(
                &self.config.queue_name,
                &self.config.exchange_name,
                &self.config.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        info!(queue = %self.config.queue_name, exchange = %self.config.exchange_name, "connected to broker");
        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    /// Drives the consume loop until `shutdown` is notified. Deliveries are
    /// JSON-decoded, routed through the batcher (if enabled) or handled
    /// directly, and acked/nacked/rejected per `MessageOutcome`.
    pub async fn run(&self, metrics: Arc<ConsumerMetrics>, shutdown: Arc<Notify>) -> Result<(), ConsumerError> {
        let channel = self.channel.as_ref().ok_or_else(|| ConsumerError::Broker("not connected".to_string()))?;

        let mut consumer = channel
            .basic_consume(
                &self.config.queue_name,
                "cloudbill-consumer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Broker(e.to_string()))?;

        let batcher = self.use_batching.then(|| {
            let batcher = Arc::new(MessageBatcher::new(
                self.config.batch_size,
                self.config.batch_concurrency,
                Arc::clone(&self.handler),
                Arc::clone(&metrics),
            ));
            batcher.spawn_flush_loop(self.config.batch_timeout);
            batcher
        });

        metrics.mark_started(chrono::Utc::now());

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("shutdown signal received, draining consumer");
                    if let Some(batcher) = &batcher {
                        batcher.flush().await;
                        batcher.wait_idle(self.config.batch_concurrency).await;
                    }
                    return Ok(());
                }
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else {
                        warn!("consumer stream ended");
                        return Ok(());
                    };
                    let delivery = match delivery {
                        Ok(d) => d,
                        Err(err) => {
                            error!(%err, "error receiving delivery");
                            continue;
                        }
                    };
                    metrics.mark_received(chrono::Utc::now()).await;

                    let body: serde_json::Value = match serde_json::from_slice(&delivery.data) {
                        Ok(v) => v,
                        Err(err) => {
                            warn!(%err, "malformed message body, rejecting without requeue");
                            if let Err(err) = delivery.reject(BasicRejectOptions { requeue: false }).await {
                                warn!(%err, "failed to reject malformed delivery");
                            }
                            continue;
                        }
                    };

                    match &batcher {
                        Some(batcher) => batcher.add(delivery, body).await,
                        None => {
                            let outcome = self.handler.process_message(&body).await;
                            ack_delivery(&delivery, outcome, &metrics).await;
                        }
                    }
                }
            }
        }
    }

    pub async fn disconnect(&mut self) -> Result<(), ConsumerError> {
        if let Some(channel) = self.channel.take() {
            channel.close(200, "shutting down").await.map_err(|e| ConsumerError::Broker(e.to_string()))?;
        }
        if let Some(connection) = self.connection.take() {
            connection.close(200, "shutting down").await.map_err(|e| ConsumerError::Broker(e.to_string()))?;
        }
        Ok(())
    }
}

async fn ack_delivery(delivery: &lapin::message::Delivery, outcome: MessageOutcome, metrics: &Arc<ConsumerMetrics>) {
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
