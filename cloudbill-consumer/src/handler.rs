//! Event → downstream-operation dispatch (spec §4.5's "Event→operation
//! map"). Grounded on `original_source/mq_consumer/handlers.py::EventHandler`.

use cloudbill_apiclient::{ApiClient, ApiResponse, ApiResult};
use cloudbill_errors::ConsumerError;
use cloudbill_models::{EventType, NormalizedEvent, ResourceType};
use cloudbill_normalizer::parse_message;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// What the consumer should do with the raw delivery once a message has
/// been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Ack,
    NackRequeue,
    RejectNoRequeue,
}

#[derive(Debug, Default, Clone)]
pub struct ProcessingStats {
    pub total_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub conflicts: u64,
    pub not_found: u64,
    pub by_resource_type: HashMap<String, u64>,
    pub by_event_type: HashMap<String, u64>,
}

pub struct EventHandler {
    api_client: ApiClient,
    skip_wallet: bool,
    stats: Mutex<ProcessingStats>,
}

impl EventHandler {
    pub fn new(api_client: ApiClient, skip_wallet: bool) -> Self {
        Self {
            api_client,
            skip_wallet,
            stats: Mutex::new(ProcessingStats::default()),
        }
    }

    /// Decodes and classifies one raw delivery body. Returns
    /// `RejectNoRequeue` immediately (no downstream call at all) when the
    /// normalizer can't classify the message — spec §4.1/§7: unparseable or
    /// unclassifiable messages are DLQ-bound, not retryable.
    pub async fn process_message(&self, body: &serde_json::Value) -> MessageOutcome {
        let Some(event) = parse_message(body) else {
            warn!(event_type = ?body.get("event_type"), "message could not be classified, routing to DLQ");
            return MessageOutcome::RejectNoRequeue;
        };
        self.process_event(&event).await
    }

    pub async fn process_event(&self, event: &NormalizedEvent) -> MessageOutcome {
        if !self.skip_wallet {
            if let Err(err) = self.ensure_wallet(event).await {
                debug!(%err, user_id = %event.user_id, "wallet bootstrap skipped, continuing with event processing");
            }
        }

        let response = match event.resource_type {
            ResourceType::Compute => self.handle_compute(event).await,
            ResourceType::Disk => self.handle_disk(event).await,
            ResourceType::FloatingIp => self.handle_floating_ip(event).await,
        };

        self.record(event, &response);
        self.to_outcome(&response)
    }

    async fn ensure_wallet(&self, event: &NormalizedEvent) -> Result<(), ConsumerError> {
        let response = self.api_client.ensure_wallet_exists(&event.user_id).await;
        if response.result == ApiResult::Error {
            return Err(ConsumerError::Broker(response.error.unwrap_or_default()));
        }
        Ok(())
    }

    async fn handle_compute(&self, event: &NormalizedEvent) -> ApiResponse {
        match event.event_type {
            EventType::Create => {
                self.api_client
                    .create_compute(&event.resource_id, &event.user_id, event.payload_str("flavor").unwrap_or("small"))
                    .await
            }
            EventType::Delete => self.api_client.delete_compute(&event.resource_id).await,
            EventType::Start | EventType::Stop | EventType::Update => {
                self.api_client.update_compute(&event.resource_id, event.payload_str("state"), None).await
            }
            EventType::Resize => self.api_client.update_compute(&event.resource_id, None, event.payload_str("flavor")).await,
            _ => {
                self.api_client
                    .update_compute(&event.resource_id, event.payload_str("state"), event.payload_str("flavor"))
                    .await
            }
        }
    }

    async fn handle_disk(&self, event: &NormalizedEvent) -> ApiResponse {
        match event.event_type {
            EventType::Create => {
                self.api_client
                    .create_disk(&event.resource_id, &event.user_id, event.payload_i64("size_gb").unwrap_or(10))
                    .await
            }
            EventType::Delete => self.api_client.delete_disk(&event.resource_id).await,
            EventType::Resize => self.api_client.update_disk(&event.resource_id, event.payload_i64("size_gb")).await,
            EventType::Attach | EventType::Detach => success_noop(),
            _ => self.api_client.update_disk(&event.resource_id, event.payload_i64("size_gb")).await,
        }
    }

    async fn handle_floating_ip(&self, event: &NormalizedEvent) -> ApiResponse {
        match event.event_type {
            EventType::Create | EventType::Allocate => {
                self.api_client
                    .create_floating_ip(&event.resource_id, &event.user_id, event.payload_str("ip_address").unwrap_or("0.0.0.0"))
                    .await
            }
            EventType::Delete | EventType::Release => self.api_client.release_floating_ip(&event.resource_id).await,
            _ => success_noop(),
        }
    }

    /// Success and conflict ack (idempotent replay). A downstream `not
    /// found` on what's always an update/delete call is treated as a
    /// terminal success rather than requeued — the upstream resource is
    /// gone, so retrying can never turn it into a hit (spec §7's
    /// documented implementation choice; see DESIGN.md). Any other error
    /// (timeout, connection, 5xx, unexpected 4xx) nacks with requeue.
    fn to_outcome(&self, response: &ApiResponse) -> MessageOutcome {
        match response.result {
            ApiResult::Success | ApiResult::Conflict | ApiResult::NotFound => MessageOutcome::Ack,
            ApiResult::Error => MessageOutcome::NackRequeue,
        }
    }

    fn record(&self, event: &NormalizedEvent, response: &ApiResponse) {
        let mut stats = self.stats.lock().expect("processing stats mutex poisoned");
        stats.total_processed += 1;
        if matches!(response.result, ApiResult::Error) {
            stats.failed += 1;
        } else {
            stats.successful += 1;
        }
        match response.result {
            ApiResult::Conflict => stats.conflicts += 1,
            ApiResult::NotFound => stats.not_found += 1,
            _ => {}
        }
        *stats.by_resource_type.entry(event.resource_type.as_str().to_string()).or_insert(0) += 1;
        *stats.by_event_type.entry(event.event_type.as_str().to_string()).or_insert(0) += 1;
    }

    pub fn stats_snapshot(&self) -> ProcessingStats {
        self.stats.lock().expect("processing stats mutex poisoned").clone()
    }
}

fn success_noop() -> ApiResponse {
    ApiResponse {
        result: ApiResult::Success,
        status_code: 200,
        data: None,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_ack_not_requeue() {
        let handler_outcome = |result: ApiResult| -> MessageOutcome {
            match result {
                ApiResult::Success | ApiResult::Conflict | ApiResult::NotFound => MessageOutcome::Ack,
                ApiResult::Error => MessageOutcome::NackRequeue,
            }
        };
        assert_eq!(handler_outcome(ApiResult::NotFound), MessageOutcome::Ack);
        assert_eq!(handler_outcome(ApiResult::Conflict), MessageOutcome::Ack);
        assert_eq!(handler_outcome(ApiResult::Error), MessageOutcome::NackRequeue);
    }
}
