//! Persistence for `Bill` documents (the `billing_cycles` collection, per
//! spec §6, implemented as a Postgres table with a JSONB `charges` column —
//! see `SPEC_FULL.md` §12 for why this crate follows the teacher's
//! document-in-JSONB precedent instead of introducing a Mongo driver).

use chrono::{DateTime, Utc};
use cloudbill_errors::BillingError;
use cloudbill_models::{Bill, BillStatus, Charge};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};

pub type StoreResult<T> = Result<T, BillingError>;

#[derive(Clone)]
pub struct BillStore {
    pool: PgPool,
}

impl BillStore {
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        Self::initialize_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn initialize_schema(pool: &PgPool) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS billing_cycles (
                bill_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                period_start TIMESTAMPTZ NOT NULL,
                period_end TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                charges JSONB NOT NULL,
                total NUMERIC(20, 6) NOT NULL,
                paid BOOLEAN NOT NULL DEFAULT FALSE,
                price_version TEXT NOT NULL,
                generated_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_billing_cycles_user
                ON billing_cycles(user_id, generated_at DESC);
            "#,
        )
        .execute(pool)
        .await
        .map_err(BillingError::Database)?;
        Ok(())
    }

    pub async fn insert(&self, bill: &Bill) -> StoreResult<()> {
        let charges = serde_json::to_value(&bill.charges)
            .map_err(|e| BillingError::Database(sqlx::Error::Decode(Box::new(e))))?;

        sqlx::query(
            r#"
            INSERT INTO billing_cycles
                (bill_id, user_id, period_start, period_end, status, charges, total, paid, price_version, generated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&bill.bill_id)
        .bind(&bill.user_id)
        .bind(bill.period_start)
        .bind(bill.period_end)
        .bind(status_str(bill.status))
        .bind(charges)
        .bind(bill.total)
        .bind(bill.paid)
        .bind(&bill.price_version)
        .bind(bill.generated_at)
        .execute(&self.pool)
        .await
        .map_err(BillingError::Database)?;

        Ok(())
    }

    pub async fn set_status(&self, bill_id: &str, status: BillStatus, paid: bool) -> StoreResult<()> {
        sqlx::query("UPDATE billing_cycles SET status = $2, paid = $3 WHERE bill_id = $1")
            .bind(bill_id)
            .bind(status_str(status))
            .bind(paid)
            .execute(&self.pool)
            .await
            .map_err(BillingError::Database)?;
        Ok(())
    }

    pub async fn get(&self, bill_id: &str) -> StoreResult<Option<Bill>> {
        let row = sqlx::query(
            r#"SELECT bill_id, user_id, period_start, period_end, status, charges, total, paid, price_version, generated_at
               FROM billing_cycles WHERE bill_id = $1"#,
        )
        .bind(bill_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(BillingError::Database)?;

        row.map(row_to_bill).transpose()
    }

    pub async fn get_for_user(&self, user_id: &str) -> StoreResult<Vec<Bill>> {
        let rows = sqlx::query(
            r#"SELECT bill_id, user_id, period_start, period_end, status, charges, total, paid, price_version, generated_at
               FROM billing_cycles WHERE user_id = $1 ORDER BY generated_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(BillingError::Database)?;

        rows.into_iter().map(row_to_bill).collect()
    }
}

fn status_str(status: BillStatus) -> &'static str {
    match status {
        BillStatus::Pending => "pending",
        BillStatus::Success => "success",
        BillStatus::Failed => "failed",
    }
}

fn status_from_str(s: &str) -> BillStatus {
    match s {
        "success" => BillStatus::Success,
        "failed" => BillStatus::Failed,
        _ => BillStatus::Pending,
    }
}

fn row_to_bill(row: sqlx::postgres::PgRow) -> StoreResult<Bill> {
    let charges_json: serde_json::Value = row.try_get("charges").map_err(BillingError::Database)?;
    let charges: Vec<Charge> =
        serde_json::from_value(charges_json).map_err(|e| BillingError::Database(sqlx::Error::Decode(Box::new(e))))?;
    let status: String = row.try_get("status").map_err(BillingError::Database)?;
    let total: Decimal = row.try_get("total").map_err(BillingError::Database)?;
    let generated_at: DateTime<Utc> = row.try_get("generated_at").map_err(BillingError::Database)?;

    Ok(Bill {
        bill_id: row.try_get("bill_id").map_err(BillingError::Database)?,
        user_id: row.try_get("user_id").map_err(BillingError::Database)?,
        period_start: row.try_get("period_start").map_err(BillingError::Database)?,
        period_end: row.try_get("period_end").map_err(BillingError::Database)?,
        status: status_from_str(&status),
        charges,
        total,
        paid: row.try_get("paid").map_err(BillingError::Database)?,
        price_version: row.try_get("price_version").map_err(BillingError::Database)?,
        generated_at,
    })
}
