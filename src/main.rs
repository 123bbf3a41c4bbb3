//! Binary entry point: loads configuration, connects to Postgres and the
//! broker, runs the consumer until a shutdown signal arrives, then drains
//! in-flight work before closing the broker and HTTP connections.
//!
//! Shutdown order (spec §6): stop accepting new deliveries, drain in-flight
//! handlers, flush the batcher, close the broker channel/connection, and
//! only then let the API client's HTTP pool drop.

use anyhow::{Context, Result};
use cloudbill_apiclient::{ApiClient, ApiClientConfig};
use cloudbill_billing::{BillStore, BillingEngine};
use cloudbill_consumer::{ConsumerConfig, ConsumerMetrics, EventHandler, MqConfig, MqConsumer};
use cloudbill_pricing::PriceCatalog;
use cloudbill_resourcestore::ResourceStore;
use cloudbill_wallet::WalletStore;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("cloudbill=info".parse()?))
        .json()
        .init();

    info!("starting cloudbill");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let resources = ResourceStore::from_pool(pool.clone()).await.context("resource store schema init failed")?;
    let wallet = WalletStore::from_pool(pool.clone()).await.context("wallet store schema init failed")?;
    let pricing = PriceCatalog::from_pool(pool.clone()).await.context("price catalog schema init failed")?;
    let bills = BillStore::from_pool(pool.clone()).await.context("bill store schema init failed")?;
    let billing_engine = Arc::new(BillingEngine::new(resources, wallet, pricing, bills));

    let api_client = ApiClient::new(ApiClientConfig::from_env()).context("failed to build API client")?;
    if !api_client.health_check().await {
        warn!("billing API health check failed at startup, continuing anyway");
    }

    let consumer_config = ConsumerConfig::from_env();
    let mq_config = MqConfig::from_env();
    let handler = Arc::new(EventHandler::new(api_client, consumer_config.skip_wallet));
    let metrics = Arc::new(ConsumerMetrics::default());

    let mut consumer = MqConsumer::new(mq_config, Arc::clone(&handler), consumer_config.use_batching);
    consumer.connect().await.context("failed to connect to broker")?;

    let shutdown = Arc::new(Notify::new());
    spawn_signal_listener(Arc::clone(&shutdown));
    spawn_metrics_logger(Arc::clone(&metrics));
    spawn_billing_cycle_ticker(Arc::clone(&billing_engine));

    consumer.run(Arc::clone(&metrics), Arc::clone(&shutdown)).await.context("consumer loop exited with error")?;

    info!("disconnecting from broker");
    if let Err(err) = consumer.disconnect().await {
        error!(%err, "error while disconnecting from broker");
    }

    info!("cloudbill shut down cleanly");
    Ok(())
}

/// Listens for SIGTERM (container orchestrators) and SIGINT (Ctrl+C) and
/// notifies the consumer loop exactly once.
fn spawn_signal_listener(shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        }
        shutdown.notify_one();
    });
}

/// Logs a metrics snapshot every minute, matching
/// `original_source/mq_consumer/__main__.py`'s periodic status line.
fn spawn_metrics_logger(metrics: Arc<ConsumerMetrics>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let snapshot = metrics.snapshot(chrono::Utc::now()).await;
            info!(
                received = snapshot.messages_received,
                processed = snapshot.messages_processed,
                failed = snapshot.messages_failed,
                requeued = snapshot.messages_requeued,
                rate = snapshot.messages_per_second,
                uptime_seconds = snapshot.uptime_seconds,
                "consumer metrics"
            );
        }
    });
}

/// Periodically drives billing cycles for users with stale cursors. The
/// upstream scheduling system (cron, a scheduler service) is out of scope
/// per spec Non-goals; this loop exists only so the binary is runnable
/// standalone without an external trigger.
fn spawn_billing_cycle_ticker(engine: Arc<BillingEngine>) {
    tokio::spawn(async move {
        let interval_secs: u64 = std::env::var("BILLING_CYCLE_INTERVAL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(3600);
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            let Ok(user_ids) = std::env::var("BILLING_CYCLE_USER_IDS") else {
                continue;
            };
            for user_id in user_ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match engine.compute_bill(user_id, None).await {
                    Ok(outcome) => info!(%user_id, ?outcome, "billing cycle completed"),
                    Err(err) => error!(%user_id, %err, "billing cycle failed"),
                }
            }
        }
    });
}
