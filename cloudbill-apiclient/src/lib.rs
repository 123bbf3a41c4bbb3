//! HTTP client the consumer uses to call the resource/wallet/billing CRUD
//! services (spec §4.6, §6). Connection pooling and keepalive come from a
//! single process-wide `reqwest::Client`; retries are linear-backoff and
//! limited to timeout/connection failures — HTTP 4xx responses (other than
//! 404/409, which are structured outcomes, not failures) are never retried.
//!
//! Grounded on `original_source/mq_consumer/api_client.py`'s
//! `BillingAPIClient`/`APIResponse`/`APIResult`.

use cloudbill_errors::ApiClientError;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Structured outcome of one API call, mirroring `APIResult` in the Python
/// original: downstream `conflict`/`not_found` are first-class results, not
/// errors, so callers (the consumer's event handlers) can treat `Conflict`
/// as success for idempotent creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiResult {
    Success,
    Conflict,
    NotFound,
    Error,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub result: ApiResult,
    pub status_code: u16,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ApiResponse {
    /// Per spec §4.5's ack policy: success or conflict ack, anything else nacks.
    pub fn is_ok_for_ingestion(&self) -> bool {
        matches!(self.result, ApiResult::Success | ApiResult::Conflict)
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub api_prefix: String,
    pub timeout: Duration,
    pub max_keepalive: usize,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_prefix: "/api/v1".to_string(),
            timeout: Duration::from_secs(30),
            max_keepalive: 20,
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl ApiClientConfig {
    /// Mirrors `original_source/mq_consumer/config.py::APIConfig`'s
    /// environment variables.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            base_url: std::env::var("BILLING_API_URL").unwrap_or(default.base_url),
            api_prefix: default.api_prefix,
            timeout: std::env::var("API_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs_f64)
                .unwrap_or(default.timeout),
            max_keepalive: std::env::var("API_MAX_KEEPALIVE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_keepalive),
            retry_count: std::env::var("API_RETRY_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.retry_count),
            retry_delay: std::env::var("API_RETRY_DELAY")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs_f64)
                .unwrap_or(default.retry_delay),
        }
    }
}

#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    config: ApiClientConfig,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> Result<Self, ApiClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_keepalive)
            .build()?;
        Ok(Self { client, config })
    }

    async fn request(&self, method: reqwest::Method, path: &str, body: Option<Value>, retry_count: u32) -> ApiResponse {
        let url = format!("{}{}{}", self.config.base_url, self.config.api_prefix, path);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut req = self.client.request(method.clone(), &url);
            if let Some(b) = &body {
                req = req.json(b);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();

                    if status == 409 {
                        let data = resp.json::<Value>().await.ok();
                        return ApiResponse { result: ApiResult::Conflict, status_code: 409, data, error: None };
                    }
                    if status == 404 {
                        return ApiResponse {
                            result: ApiResult::NotFound,
                            status_code: 404,
                            data: None,
                            error: Some("Resource not found".to_string()),
                        };
                    }
                    if status >= 400 {
                        let error = resp.text().await.unwrap_or_default();
                        return ApiResponse { result: ApiResult::Error, status_code: status, data: None, error: Some(error) };
                    }

                    let data = resp.json::<Value>().await.ok();
                    return ApiResponse { result: ApiResult::Success, status_code: status, data, error: None };
                }
                Err(err) => {
                    let transient = err.is_timeout() || err.is_connect();
                    if !transient || attempt >= retry_count {
                        warn!(%url, attempt, %err, "request failed, giving up");
                        return ApiResponse {
                            result: ApiResult::Error,
                            status_code: 0,
                            data: None,
                            error: Some(err.to_string()),
                        };
                    }
                    warn!(%url, attempt, retry_count, %err, "transient request error, retrying");
                    tokio::time::sleep(self.config.retry_delay * attempt).await;
                }
            }
        }
    }

    async fn call(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> ApiResponse {
        self.request(method, path, body, self.config.retry_count).await
    }

    pub async fn create_compute(&self, resource_id: &str, user_id: &str, flavor: &str) -> ApiResponse {
        self.call(
            reqwest::Method::POST,
            "/resources/computes",
            Some(serde_json::json!({"resource_id": resource_id, "user_id": user_id, "flavor": flavor})),
        )
        .await
    }

    pub async fn update_compute(&self, resource_id: &str, state: Option<&str>, flavor: Option<&str>) -> ApiResponse {
        let mut payload = serde_json::Map::new();
        if let Some(s) = state {
            payload.insert("state".to_string(), Value::String(s.to_string()));
        }
        if let Some(f) = flavor {
            payload.insert("flavor".to_string(), Value::String(f.to_string()));
        }
        if payload.is_empty() {
            return ApiResponse { result: ApiResult::Success, status_code: 200, data: None, error: None };
        }
        self.call(
            reqwest::Method::PATCH,
            &format!("/resources/computes/{resource_id}"),
            Some(Value::Object(payload)),
        )
        .await
    }

    pub async fn delete_compute(&self, resource_id: &str) -> ApiResponse {
        self.call(reqwest::Method::DELETE, &format!("/resources/computes/{resource_id}"), None).await
    }

    pub async fn create_disk(&self, resource_id: &str, user_id: &str, size_gb: i64) -> ApiResponse {
        self.call(
            reqwest::Method::POST,
            "/resources/disks",
            Some(serde_json::json!({"resource_id": resource_id, "user_id": user_id, "size_gb": size_gb})),
        )
        .await
    }

    pub async fn update_disk(&self, resource_id: &str, size_gb: Option<i64>) -> ApiResponse {
        let Some(size_gb) = size_gb else {
            return ApiResponse { result: ApiResult::Success, status_code: 200, data: None, error: None };
        };
        self.call(
            reqwest::Method::PATCH,
            &format!("/resources/disks/{resource_id}"),
            Some(serde_json::json!({"size_gb": size_gb})),
        )
        .await
    }

    pub async fn delete_disk(&self, resource_id: &str) -> ApiResponse {
        self.call(reqwest::Method::DELETE, &format!("/resources/disks/{resource_id}"), None).await
    }

    pub async fn create_floating_ip(&self, resource_id: &str, user_id: &str, ip_address: &str) -> ApiResponse {
        self.call(
            reqwest::Method::POST,
            "/resources/floating-ips",
            Some(serde_json::json!({"resource_id": resource_id, "user_id": user_id, "ip_address": ip_address})),
        )
        .await
    }

    pub async fn release_floating_ip(&self, resource_id: &str) -> ApiResponse {
        self.call(reqwest::Method::DELETE, &format!("/resources/floating-ips/{resource_id}"), None).await
    }

    pub async fn create_wallet(&self, user_id: &str, balance: &str, currency: &str) -> ApiResponse {
        self.call(
            reqwest::Method::POST,
            "/wallets",
            Some(serde_json::json!({"user_id": user_id, "balance": balance, "currency": currency, "auto_recharge": false})),
        )
        .await
    }

    pub async fn get_wallet(&self, user_id: &str) -> ApiResponse {
        self.call(reqwest::Method::GET, &format!("/wallets/{user_id}"), None).await
    }

    /// Best-effort wallet bootstrap (spec §4.5): creates a zero-balance
    /// wallet if one doesn't exist yet. Callers must not let failure here
    /// block event processing.
    pub async fn ensure_wallet_exists(&self, user_id: &str) -> ApiResponse {
        let response = self.get_wallet(user_id).await;
        if response.result == ApiResult::NotFound {
            return self.create_wallet(user_id, "0", "USD").await;
        }
        response
    }

    pub async fn compute_bill(&self, user_id: &str) -> ApiResponse {
        self.call(reqwest::Method::POST, "/billing/compute", Some(serde_json::json!({"user_id": user_id}))).await
    }

    pub async fn retry_bill(&self, bill_id: &str) -> ApiResponse {
        self.call(reqwest::Method::POST, &format!("/billing/{bill_id}/retry"), None).await
    }

    pub async fn get_bill(&self, bill_id: &str) -> ApiResponse {
        self.call(reqwest::Method::GET, &format!("/billing/{bill_id}"), None).await
    }

    /// Single-attempt health probe used at startup, matching
    /// `original_source/mq_consumer/__main__.py::run_consumer`'s
    /// pre-flight check.
    pub async fn health_check(&self) -> bool {
        let response = self.request(reqwest::Method::GET, "/health", None, 1).await;
        response.result == ApiResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_and_success_ack_ingestion() {
        let conflict = ApiResponse { result: ApiResult::Conflict, status_code: 409, data: None, error: None };
        let success = ApiResponse { result: ApiResult::Success, status_code: 201, data: None, error: None };
        let not_found = ApiResponse { result: ApiResult::NotFound, status_code: 404, data: None, error: None };
        assert!(conflict.is_ok_for_ingestion());
        assert!(success.is_ok_for_ingestion());
        assert!(!not_found.is_ok_for_ingestion());
    }

    #[test]
    fn config_defaults_match_python_original() {
        let config = ApiClientConfig::default();
        assert_eq!(config.base_url, "http://localhost:8000");
        assert_eq!(config.retry_count, 3);
    }
}
