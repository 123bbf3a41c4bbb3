use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-hour rate for one compute flavor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeRate {
    pub per_hour: Decimal,
}

/// The full price schedule for one currency, as read by the billing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceCatalogEntry {
    pub currency: String,
    pub compute: HashMap<String, ComputeRate>,
    pub disk_per_gb_hour: Decimal,
    pub floating_ip_per_hour: Decimal,
    pub price_version: String,
}

impl PriceCatalogEntry {
    /// `pricing.compute[flavor]` else `pricing.compute["others"]` else zero.
    pub fn compute_rate(&self, flavor: &str) -> Decimal {
        self.compute
            .get(flavor)
            .or_else(|| self.compute.get("others"))
            .map(|r| r.per_hour)
            .unwrap_or(Decimal::ZERO)
    }
}
