//! Pure `raw_message -> Option<NormalizedEvent>` classification, the first
//! stage of the ingestion pipeline. No I/O, no state: callers that get `None`
//! back must drop the message to the DLQ rather than retry it.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use cloudbill_models::{ComputeState, DiskState, EventType, NormalizedEvent, ResourceType};
use serde_json::Value;
use std::collections::HashMap;

/// Upstream OpenStack instance-state vocabulary collapsed onto the
/// billing-internal one.
fn openstack_state_map(state: &str) -> &'static str {
    match state {
        "active" => "running",
        "stopped" => "stopped",
        "paused" => "stopped",
        "suspended" => "stopped",
        "shutoff" => "stopped",
        "deleted" => "deleted",
        "error" => "stopped",
        "build" => "running",
        _ => "stopped",
    }
}

fn lower_str(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .to_lowercase()
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn parse_timestamp(value: Option<&Value>) -> DateTime<Utc> {
    match value {
        Some(Value::Number(n)) => {
            if let Some(secs) = n.as_i64() {
                return Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now);
            }
            if let Some(secs) = n.as_f64() {
                let whole = secs.trunc() as i64;
                let nanos = ((secs.fract()) * 1_000_000_000.0) as u32;
                return Utc
                    .timestamp_opt(whole, nanos)
                    .single()
                    .unwrap_or_else(Utc::now);
            }
            Utc::now()
        }
        Some(Value::String(s)) => parse_timestamp_str(s).unwrap_or_else(Utc::now),
        _ => Utc::now(),
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    const FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    for fmt in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

fn extract_user_id(message: &Value) -> Option<String> {
    let payload = message.get("payload").cloned().unwrap_or_else(empty_object);

    if let Some(fip) = payload.get("floatingip") {
        for key in ["tenant_id", "project_id", "user_id"] {
            if let Some(v) = fip.get(key) {
                return Some(value_to_string(v));
            }
        }
    }

    for key in ["user_id", "tenant_id", "project_id", "owner_id", "owner"] {
        if let Some(v) = message.get(key) {
            return Some(value_to_string(v));
        }
        if let Some(v) = payload.get(key) {
            return Some(value_to_string(v));
        }
    }
    None
}

fn extract_resource_id(message: &Value) -> Option<String> {
    let payload = message.get("payload").cloned().unwrap_or_else(empty_object);

    if let Some(fip) = payload.get("floatingip") {
        if let Some(v) = fip.get("id") {
            return Some(value_to_string(v));
        }
    }

    for key in ["resource_id", "instance_id", "volume_id", "floatingip_id", "id"] {
        if let Some(v) = message.get(key) {
            return Some(value_to_string(v));
        }
        if let Some(v) = payload.get(key) {
            return Some(value_to_string(v));
        }
    }
    None
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn detect_resource_type(message: &Value) -> Option<ResourceType> {
    let event_type = lower_str(message, "event_type");
    let routing_key = lower_str(message, "_routing_key");

    if ["instance", "compute", "server"].iter().any(|x| event_type.contains(x)) {
        return Some(ResourceType::Compute);
    }
    if ["volume", "disk"].iter().any(|x| event_type.contains(x)) {
        return Some(ResourceType::Disk);
    }
    if ["floatingip", "floating_ip", "fip"].iter().any(|x| event_type.contains(x)) {
        return Some(ResourceType::FloatingIp);
    }

    if routing_key.contains("compute") || routing_key.contains("nova") {
        return Some(ResourceType::Compute);
    }
    if routing_key.contains("volume") || routing_key.contains("cinder") {
        return Some(ResourceType::Disk);
    }
    if routing_key.contains("floatingip") || routing_key.contains("neutron") {
        if message.to_string().to_lowercase().contains("floatingip") {
            return Some(ResourceType::FloatingIp);
        }
    }

    let payload = message.get("payload").cloned().unwrap_or_else(empty_object);
    if payload.get("instance_id").is_some() || payload.get("flavor").is_some() {
        return Some(ResourceType::Compute);
    }
    if payload.get("volume_id").is_some()
        || (payload.get("size").is_some() && payload.get("instance_id").is_none())
    {
        return Some(ResourceType::Disk);
    }
    if payload.get("floating_ip_address").is_some() || payload.get("floatingip").is_some() {
        return Some(ResourceType::FloatingIp);
    }

    None
}

fn detect_event_type(message: &Value) -> EventType {
    let event_str = lower_str(message, "event_type");

    if ["create", "build", "spawn"].iter().any(|x| event_str.contains(x)) {
        return EventType::Create;
    }
    if ["delete", "destroy", "terminate"].iter().any(|x| event_str.contains(x)) {
        return EventType::Delete;
    }
    if ["start", "power_on", "resume", "unpause"].iter().any(|x| event_str.contains(x)) {
        return EventType::Start;
    }
    if ["stop", "power_off", "pause", "suspend", "shutdown"]
        .iter()
        .any(|x| event_str.contains(x))
    {
        return EventType::Stop;
    }
    if event_str.contains("resize") {
        return EventType::Resize;
    }
    if event_str.contains("attach") {
        return EventType::Attach;
    }
    if event_str.contains("detach") {
        return EventType::Detach;
    }
    if event_str.contains("allocate") {
        return EventType::Allocate;
    }
    if ["release", "deallocate"].iter().any(|x| event_str.contains(x)) {
        return EventType::Release;
    }
    EventType::Update
}

fn parse_compute_payload(
    message: &Value,
    event_type: EventType,
) -> HashMap<String, Value> {
    let payload = message.get("payload").cloned().unwrap_or_else(|| message.clone());
    let mut result = HashMap::new();

    let flavor_name = match payload.get("flavor") {
        Some(Value::Object(_)) => payload["flavor"]
            .get("name")
            .or_else(|| payload["flavor"].get("id"))
            .map(value_to_string),
        Some(other) => Some(value_to_string(other)),
        None => payload
            .get("instance_type")
            .map(value_to_string),
    };

    let state = if let Some(raw) = payload.get("state").and_then(|v| v.as_str()) {
        Some(openstack_state_map(&raw.to_lowercase()).to_string())
    } else {
        match event_type {
            EventType::Create | EventType::Start => Some(ComputeState::Running.as_str().to_string()),
            EventType::Delete => Some(ComputeState::Deleted.as_str().to_string()),
            EventType::Stop => Some(ComputeState::Stopped.as_str().to_string()),
            _ => None,
        }
    };

    if let Some(flavor) = flavor_name {
        result.insert("flavor".to_string(), Value::String(flavor));
    }
    if let Some(state) = state {
        result.insert("state".to_string(), Value::String(state));
    }
    result
}

fn parse_disk_payload(message: &Value, event_type: EventType) -> HashMap<String, Value> {
    let payload = message.get("payload").cloned().unwrap_or_else(|| message.clone());
    let mut result = HashMap::new();

    if let Some(size) = payload.get("size").and_then(|v| v.as_i64()) {
        result.insert("size_gb".to_string(), Value::from(size));
    }

    let attached_to = payload.get("attachments").and_then(|att| {
        let first = match att {
            Value::Array(arr) => arr.first(),
            other => Some(other),
        };
        first.and_then(|a| {
            a.get("server_id")
                .or_else(|| a.get("instance_id"))
                .map(value_to_string)
        })
    }).or_else(|| payload.get("instance_uuid").map(value_to_string));
    if let Some(attached_to) = attached_to {
        result.insert("attached_to".to_string(), Value::String(attached_to));
    }

    let state = if let Some(status) = payload.get("status").and_then(|v| v.as_str()) {
        match status.to_lowercase().as_str() {
            "in-use" => Some(DiskState::Attached.as_str().to_string()),
            "available" => Some(DiskState::Detached.as_str().to_string()),
            "deleted" => Some(DiskState::Deleted.as_str().to_string()),
            _ => None,
        }
    } else {
        match event_type {
            EventType::Delete => Some(DiskState::Deleted.as_str().to_string()),
            EventType::Attach => Some(DiskState::Attached.as_str().to_string()),
            EventType::Detach => Some(DiskState::Detached.as_str().to_string()),
            _ => None,
        }
    };
    if let Some(state) = state {
        result.insert("state".to_string(), Value::String(state));
    }

    result
}

fn parse_floating_ip_payload(message: &Value) -> HashMap<String, Value> {
    let outer = message.get("payload").cloned().unwrap_or_else(|| message.clone());
    let payload = outer.get("floatingip").cloned().unwrap_or(outer);
    let mut result = HashMap::new();

    for key in ["floating_ip_address", "ip_address", "floating_ip", "address"] {
        if let Some(v) = payload.get(key) {
            result.insert("ip_address".to_string(), Value::String(value_to_string(v)));
            break;
        }
    }

    if let Some(port_id) = payload.get("port_id") {
        result.insert("port_id".to_string(), port_id.clone());
    }

    for key in ["fixed_ip_address", "instance_id", "server_id"] {
        if payload.get(key).is_some() {
            let attached_to = payload
                .get("instance_id")
                .or_else(|| payload.get("server_id"))
                .map(value_to_string);
            if let Some(attached_to) = attached_to {
                result.insert("attached_to".to_string(), Value::String(attached_to));
            }
            break;
        }
    }

    result
}

/// Classify and normalize one raw queue message. Returns `None` when the
/// resource type can't be determined or `resource_id`/`user_id` are missing
/// — both cases the caller must treat as DLQ-bound, not retryable.
pub fn parse_message(message: &Value) -> Option<NormalizedEvent> {
    let resource_type = detect_resource_type(message)?;
    let event_type = detect_event_type(message);
    let resource_id = extract_resource_id(message)?;
    let user_id = extract_user_id(message)?;

    let timestamp = parse_timestamp(
        message
            .get("timestamp")
            .or_else(|| message.get("generated"))
            .or_else(|| message.get("created_at")),
    );

    let payload = match resource_type {
        ResourceType::Compute => parse_compute_payload(message, event_type),
        ResourceType::Disk => parse_disk_payload(message, event_type),
        ResourceType::FloatingIp => parse_floating_ip_payload(message),
    };

    Some(NormalizedEvent {
        resource_type,
        event_type,
        resource_id,
        user_id,
        timestamp,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_compute_create() {
        let msg = json!({
            "event_type": "compute.instance.create.end",
            "timestamp": "2024-01-01T00:00:00Z",
            "payload": {
                "instance_id": "i-1",
                "tenant_id": "u-1",
                "flavor": "small",
                "state": "active",
            }
        });
        let event = parse_message(&msg).expect("should classify");
        assert_eq!(event.resource_type, ResourceType::Compute);
        assert_eq!(event.event_type, EventType::Create);
        assert_eq!(event.resource_id, "i-1");
        assert_eq!(event.user_id, "u-1");
        assert_eq!(event.payload_str("flavor"), Some("small"));
        assert_eq!(event.payload_str("state"), Some("running"));
    }

    #[test]
    fn classifies_disk_resize() {
        let msg = json!({
            "event_type": "volume.resize.end",
            "timestamp": "2024-01-01T00:00:00Z",
            "payload": {
                "volume_id": "v-1",
                "project_id": "u-2",
                "size": 40,
            }
        });
        let event = parse_message(&msg).expect("should classify");
        assert_eq!(event.resource_type, ResourceType::Disk);
        assert_eq!(event.event_type, EventType::Resize);
        assert_eq!(event.payload_i64("size_gb"), Some(40));
    }

    #[test]
    fn classifies_floating_ip_nested_payload() {
        let msg = json!({
            "event_type": "floatingip.create.end",
            "timestamp": "2024-01-01T00:00:00Z",
            "payload": {
                "floatingip": {
                    "id": "fip-1",
                    "tenant_id": "u-3",
                    "floating_ip_address": "203.0.113.5",
                }
            }
        });
        let event = parse_message(&msg).expect("should classify");
        assert_eq!(event.resource_type, ResourceType::FloatingIp);
        assert_eq!(event.resource_id, "fip-1");
        assert_eq!(event.user_id, "u-3");
        assert_eq!(event.payload_str("ip_address"), Some("203.0.113.5"));
    }

    #[test]
    fn returns_none_without_user_id() {
        let msg = json!({
            "event_type": "compute.instance.create.end",
            "payload": { "instance_id": "i-1" }
        });
        assert!(parse_message(&msg).is_none());
    }

    #[test]
    fn returns_none_for_unclassifiable_message() {
        let msg = json!({"event_type": "unknown.thing", "payload": {}});
        assert!(parse_message(&msg).is_none());
    }

    #[test]
    fn epoch_seconds_timestamp_parses() {
        let msg = json!({
            "event_type": "compute.instance.delete.end",
            "timestamp": 1_700_000_000,
            "payload": {"instance_id": "i-9", "user_id": "u-9"}
        });
        let event = parse_message(&msg).expect("should classify");
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
    }
}
