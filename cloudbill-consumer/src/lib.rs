pub mod batcher;
pub mod config;
pub mod consumer;
pub mod handler;
pub mod metrics;

pub use config::{ConsumerConfig, MqConfig};
pub use consumer::MqConsumer;
pub use handler::{EventHandler, MessageOutcome, ProcessingStats};
pub use metrics::{ConsumerMetrics, MetricsSnapshot};
