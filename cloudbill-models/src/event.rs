use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The three resource families the engine bills for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Compute,
    Disk,
    FloatingIp,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Compute => "compute",
            ResourceType::Disk => "disk",
            ResourceType::FloatingIp => "floating_ip",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle event kinds the normalizer can classify a message into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Create,
    Update,
    Delete,
    Start,
    Stop,
    Resize,
    Attach,
    Detach,
    Allocate,
    Release,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
            EventType::Start => "start",
            EventType::Stop => "stop",
            EventType::Resize => "resize",
            EventType::Attach => "attach",
            EventType::Detach => "detach",
            EventType::Allocate => "allocate",
            EventType::Release => "release",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing-internal compute state vocabulary (collapsed from the upstream
/// OpenStack vocabulary by the normalizer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeState {
    Running,
    Stopped,
    Deleted,
}

impl ComputeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeState::Running => "running",
            ComputeState::Stopped => "stopped",
            ComputeState::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ComputeState::Running),
            "stopped" => Some(ComputeState::Stopped),
            "deleted" => Some(ComputeState::Deleted),
            _ => None,
        }
    }
}

/// Billing-internal disk state vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskState {
    Attached,
    Detached,
    Deleted,
}

impl DiskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskState::Attached => "attached",
            DiskState::Detached => "detached",
            DiskState::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "attached" => Some(DiskState::Attached),
            "detached" => Some(DiskState::Detached),
            "deleted" => Some(DiskState::Deleted),
            _ => None,
        }
    }
}

/// The canonical event produced by the normalizer from a raw queue message.
/// Immutable once built; `payload` carries resource-type-specific normalized
/// fields (`flavor`/`state` for compute, `size_gb`/`state` for disk,
/// `ip_address`/`port_id`/`attached_to` for floating IPs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub resource_type: ResourceType,
    pub event_type: EventType,
    pub resource_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: HashMap<String, serde_json::Value>,
}

impl NormalizedEvent {
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(|v| v.as_i64())
    }
}

/// One entry in a resource's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub event_id: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
}
