use crate::event::EventEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A compute instance's current projection plus its event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeResource {
    pub resource_id: String,
    pub user_id: String,
    pub state: String,
    pub current_flavor: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_billed_until: DateTime<Utc>,
    pub events: Vec<EventEntry>,
}

impl ComputeResource {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A block volume's current projection plus its event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskResource {
    pub resource_id: String,
    pub user_id: String,
    pub size_gb: i64,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_billed_until: DateTime<Utc>,
    pub events: Vec<EventEntry>,
}

impl DiskResource {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A floating IP's current projection plus its event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloatingIpResource {
    pub resource_id: String,
    pub user_id: String,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub last_billed_until: DateTime<Utc>,
    pub events: Vec<EventEntry>,
}

impl FloatingIpResource {
    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }
}
