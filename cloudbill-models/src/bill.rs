use crate::event::ResourceType;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Bill lifecycle state. Once `Success` a bill is immutable; `Pending` and
/// `Failed` may transition to `Success` via retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Pending,
    Success,
    Failed,
}

/// Which billable dimension a charge line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeKind {
    Compute,
    Disk,
    FloatingIp,
}

impl From<ResourceType> for ChargeKind {
    fn from(rt: ResourceType) -> Self {
        match rt {
            ResourceType::Compute => ChargeKind::Compute,
            ResourceType::Disk => ChargeKind::Disk,
            ResourceType::FloatingIp => ChargeKind::FloatingIp,
        }
    }
}

/// One line item on a bill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    #[serde(rename = "type")]
    pub kind: ChargeKind,
    pub resource_id: String,
    pub amount: Decimal,
}

/// A billing cycle's output: charges accumulated across a user's resources
/// and the wallet settlement outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bill {
    pub bill_id: String,
    pub user_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: BillStatus,
    pub charges: Vec<Charge>,
    pub total: Decimal,
    pub paid: bool,
    pub price_version: String,
    pub generated_at: DateTime<Utc>,
}
