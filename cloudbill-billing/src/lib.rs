//! The billing engine (spec §4.4): reconstructs billable segments from each
//! resource's event log, applies the price schedule, persists a pending
//! bill, and settles it against the wallet in two phases so a wallet
//! failure never loses the charge or re-bills an already-covered interval.

mod segments;
mod store;

pub use store::BillStore;

use chrono::{DateTime, Utc};
use cloudbill_errors::BillingError;
use cloudbill_models::{Bill, BillStatus, Charge, ChargeKind};
use cloudbill_pricing::PriceCatalog;
use cloudbill_resourcestore::ResourceStore;
use cloudbill_wallet::WalletStore;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

/// The outcome of a billing invocation: either nothing was owed (spec §4.4
/// step 6 — "return `{message: "No billable usage"}` without persisting a
/// bill") or a persisted bill, which may have settled successfully or
/// failed against the wallet.
#[derive(Debug, Clone)]
pub enum BillOutcome {
    NoBillableUsage {
        user_id: String,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },
    Bill(Bill),
}

#[derive(Clone)]
pub struct BillingEngine {
    resources: ResourceStore,
    wallet: WalletStore,
    pricing: PriceCatalog,
    bills: BillStore,
}

impl BillingEngine {
    pub fn new(resources: ResourceStore, wallet: WalletStore, pricing: PriceCatalog, bills: BillStore) -> Self {
        Self {
            resources,
            wallet,
            pricing,
            bills,
        }
    }

    /// Runs one billing cycle for `user_id` through `period_end` (defaults
    /// to now). Steps 1-7 of spec §4.4.
    pub async fn compute_bill(&self, user_id: &str, period_end: Option<DateTime<Utc>>) -> BillingResult<BillOutcome> {
        let now = Utc::now();
        let period_end = period_end.unwrap_or(now).min(now);

        let wallet = self
            .wallet
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::Wallet(cloudbill_errors::WalletError::NotFound {
                user_id: user_id.to_string(),
            }))?;

        let pricing = self
            .pricing
            .get_latest(&wallet.currency)
            .await?
            .ok_or_else(|| BillingError::Pricing(cloudbill_errors::PricingError::NotFound {
                currency: wallet.currency.clone(),
            }))?;

        let mut charges: Vec<Charge> = Vec::new();
        let mut total = Decimal::ZERO;
        let mut earliest_billed_from: Option<DateTime<Utc>> = None;

        for compute in self.resources.get_compute_by_user(user_id, true).await? {
            let end = segments::billing_end(compute.deleted_at, period_end);
            if compute.last_billed_until >= end {
                continue;
            }
            let amount = segments::canonicalize(segments::compute_charge(&compute, end, &pricing));
            if amount > Decimal::ZERO {
                earliest_billed_from = Some(earliest_billed_from.map_or(compute.last_billed_until, |e| e.min(compute.last_billed_until)));
                charges.push(Charge {
                    kind: ChargeKind::Compute,
                    resource_id: compute.resource_id.clone(),
                    amount,
                });
                total += amount;
            }
            self.resources.update_compute_last_billed(&compute.resource_id, end).await?;
        }

        for disk in self.resources.get_disk_by_user(user_id, true).await? {
            let end = segments::billing_end(disk.deleted_at, period_end);
            if disk.last_billed_until >= end {
                continue;
            }
            let amount = segments::canonicalize(segments::disk_charge(&disk, end, &pricing));
            if amount > Decimal::ZERO {
                earliest_billed_from = Some(earliest_billed_from.map_or(disk.last_billed_until, |e| e.min(disk.last_billed_until)));
                charges.push(Charge {
                    kind: ChargeKind::Disk,
                    resource_id: disk.resource_id.clone(),
                    amount,
                });
                total += amount;
            }
            self.resources.update_disk_last_billed(&disk.resource_id, end).await?;
        }

        for fip in self.resources.get_floating_ip_by_user(user_id, true).await? {
            let end = segments::billing_end(fip.released_at, period_end);
            if fip.last_billed_until >= end {
                continue;
            }
            let amount = segments::canonicalize(segments::floating_ip_charge(&fip, end, &pricing));
            if amount > Decimal::ZERO {
                earliest_billed_from = Some(earliest_billed_from.map_or(fip.last_billed_until, |e| e.min(fip.last_billed_until)));
                charges.push(Charge {
                    kind: ChargeKind::FloatingIp,
                    resource_id: fip.resource_id.clone(),
                    amount,
                });
                total += amount;
            }
            self.resources.update_floating_ip_last_billed(&fip.resource_id, end).await?;
        }

        let total = segments::canonicalize(total);
        if total == Decimal::ZERO {
            info!(%user_id, "no billable usage found for cycle");
            return Ok(BillOutcome::NoBillableUsage {
                user_id: user_id.to_string(),
                period_start: earliest_billed_from.unwrap_or(period_end),
                period_end,
            });
        }

        let bill_id = generate_bill_id(user_id, now);
        let mut bill = Bill {
            bill_id: bill_id.clone(),
            user_id: user_id.to_string(),
            period_start: earliest_billed_from.unwrap_or(period_end),
            period_end,
            status: BillStatus::Pending,
            charges,
            total,
            paid: false,
            price_version: pricing.price_version.clone(),
            generated_at: now,
        };
        self.bills.insert(&bill).await?;

        self.settle(&mut bill, now).await?;
        Ok(BillOutcome::Bill(bill))
    }

    /// Re-runs only the wallet settlement (spec §4.4 step 7 / "Retry") for
    /// an existing bill, without touching charges or resource cursors.
    /// Idempotent: retrying an already-paid bill is rejected without side
    /// effects.
    pub async fn retry(&self, bill_id: &str) -> BillingResult<Bill> {
        let mut bill = self
            .bills
            .get(bill_id)
            .await?
            .ok_or_else(|| BillingError::BillNotFound {
                bill_id: bill_id.to_string(),
            })?;

        if bill.paid {
            return Err(BillingError::AlreadyPaid {
                bill_id: bill_id.to_string(),
            });
        }

        self.settle(&mut bill, Utc::now()).await?;
        Ok(bill)
    }

    pub async fn get_bill(&self, bill_id: &str) -> BillingResult<Option<Bill>> {
        Ok(self.bills.get(bill_id).await?)
    }

    pub async fn get_user_bills(&self, user_id: &str) -> BillingResult<Vec<Bill>> {
        Ok(self.bills.get_for_user(user_id).await?)
    }

    async fn settle(&self, bill: &mut Bill, at: DateTime<Utc>) -> BillingResult<()> {
        let reason = if bill.status == BillStatus::Pending {
            format!("Billing cycle: {}", bill.bill_id)
        } else {
            format!("Retry billing: {}", bill.bill_id)
        };

        match self
            .wallet
            .debit(&bill.user_id, bill.total, &reason, Some(&bill.price_version), at)
            .await
        {
            Ok(_) => {
                bill.status = BillStatus::Success;
                bill.paid = true;
                self.bills.set_status(&bill.bill_id, bill.status, bill.paid).await?;
            }
            Err(err) => {
                warn!(bill_id = %bill.bill_id, error = %err, "wallet settlement failed, bill persisted as failed");
                bill.status = BillStatus::Failed;
                self.bills.set_status(&bill.bill_id, bill.status, bill.paid).await?;
            }
        }
        Ok(())
    }
}

/// `bill_<YYYY_MM_DD>_<user_id>_<6 hex>`, matching
/// `original_source/services/billing_service.py::_generate_bill_id`.
fn generate_bill_id(user_id: &str, at: DateTime<Utc>) -> String {
    let day = at.format("%Y_%m_%d");
    let hex = Uuid::new_v4().simple().to_string();
    format!("bill_{day}_{user_id}_{}", &hex[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bill_id_has_expected_shape() {
        let at = Utc::now();
        let id = generate_bill_id("u1", at);
        assert!(id.starts_with("bill_"));
        assert!(id.contains("_u1_"));
        assert_eq!(id.split('_').last().unwrap().len(), 6);
    }
}
