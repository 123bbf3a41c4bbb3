//! Environment-sourced configuration, mirroring
//! `original_source/mq_consumer/config.py`'s `MQConfig`/`ConsumerConfig`
//! dataclasses.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MqConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub prefetch_count: u16,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub batch_concurrency: usize,
    pub reconnect_delay: Duration,
}

impl MqConfig {
    pub fn url(&self) -> String {
        format!("amqp://{}:{}@{}:{}/{}", self.user, self.password, self.host, self.port, self.vhost)
    }

    pub fn dlq_name(&self) -> String {
        format!("{}_dlq", self.queue_name)
    }

    pub fn from_env() -> Self {
        Self {
            host: env_or("RABBITMQ_HOST", "localhost"),
            port: env_parse("RABBITMQ_PORT", 5672),
            user: env_or("RABBITMQ_USER", "guest"),
            password: env_or("RABBITMQ_PASSWORD", "guest"),
            vhost: env_or("RABBITMQ_VHOST", "/"),
            queue_name: env_or("MQ_QUEUE_NAME", "openstack_events"),
            exchange_name: env_or("MQ_EXCHANGE_NAME", "openstack"),
            routing_key: env_or("MQ_ROUTING_KEY", "resource.#"),
            prefetch_count: env_parse("MQ_PREFETCH_COUNT", 100),
            batch_size: env_parse("MQ_BATCH_SIZE", 50),
            batch_timeout: Duration::from_secs_f64(env_parse("MQ_BATCH_TIMEOUT", 1.0)),
            batch_concurrency: env_parse("MQ_BATCH_CONCURRENCY", 10),
            reconnect_delay: Duration::from_secs_f64(env_parse("MQ_RECONNECT_DELAY", 5.0)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub worker_count: usize,
    pub skip_wallet: bool,
    pub use_batching: bool,
}

impl ConsumerConfig {
    pub fn from_env() -> Self {
        Self {
            worker_count: env_parse("WORKER_COUNT", 4),
            skip_wallet: env_or("SKIP_WALLET", "true").eq_ignore_ascii_case("true"),
            use_batching: env_or("MQ_USE_BATCHING", "true").eq_ignore_ascii_case("true"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
