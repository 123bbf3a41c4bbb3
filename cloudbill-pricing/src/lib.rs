//! Versioned price catalog. Every create/update writes a brand new row rather
//! than mutating history in place — bills reference a `price_version` so a
//! later rate change never reaches back and changes an already-settled bill.

use chrono::{DateTime, Utc};
use cloudbill_errors::PricingError;
use cloudbill_models::{ComputeRate, PriceCatalogEntry};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

pub type PricingResult<T> = Result<T, PricingError>;

#[derive(Clone)]
pub struct PriceCatalog {
    pool: PgPool,
}

impl PriceCatalog {
    pub async fn new(database_url: &str) -> PricingResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(PricingError::Database)?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> PricingResult<Self> {
        Self::initialize_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn initialize_schema(pool: &PgPool) -> PricingResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_catalog (
                price_version TEXT PRIMARY KEY,
                currency TEXT NOT NULL,
                compute JSONB NOT NULL,
                disk_per_gb_hour NUMERIC(20, 6) NOT NULL,
                floating_ip_per_hour NUMERIC(20, 6) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_price_catalog_currency_created
                ON price_catalog(currency, created_at DESC);
            "#,
        )
        .execute(pool)
        .await
        .map_err(PricingError::Database)?;

        Ok(())
    }

    pub async fn create(
        &self,
        currency: &str,
        compute: HashMap<String, ComputeRate>,
        disk_per_gb_hour: Decimal,
        floating_ip_per_hour: Decimal,
        at: DateTime<Utc>,
    ) -> PricingResult<PriceCatalogEntry> {
        let price_version = self.generate_version(at).await?;
        let entry = PriceCatalogEntry {
            currency: currency.to_string(),
            compute,
            disk_per_gb_hour,
            floating_ip_per_hour,
            price_version,
        };
        self.insert(&entry, at).await?;
        Ok(entry)
    }

    /// Merges supplied fields onto the latest entry for `currency` and writes
    /// the merged result under a new version. Fails if no prior entry exists
    /// — use `create` to establish the first full catalog entry.
    pub async fn update(
        &self,
        currency: &str,
        compute_updates: HashMap<String, ComputeRate>,
        disk_per_gb_hour: Option<Decimal>,
        floating_ip_per_hour: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> PricingResult<PriceCatalogEntry> {
        let mut latest = self
            .get_latest(currency)
            .await?
            .ok_or_else(|| PricingError::IncompleteCreate {
                currency: currency.to_string(),
            })?;

        for (flavor, rate) in compute_updates {
            latest.compute.insert(flavor, rate);
        }
        if let Some(disk_rate) = disk_per_gb_hour {
            latest.disk_per_gb_hour = disk_rate;
        }
        if let Some(fip_rate) = floating_ip_per_hour {
            latest.floating_ip_per_hour = fip_rate;
        }

        let price_version = self.generate_version(at).await?;
        let entry = PriceCatalogEntry {
            currency: currency.to_string(),
            compute: latest.compute,
            disk_per_gb_hour: latest.disk_per_gb_hour,
            floating_ip_per_hour: latest.floating_ip_per_hour,
            price_version,
        };
        self.insert(&entry, at).await?;
        Ok(entry)
    }

    pub async fn get_latest(&self, currency: &str) -> PricingResult<Option<PriceCatalogEntry>> {
        let row = sqlx::query(
            r#"SELECT price_version, currency, compute, disk_per_gb_hour, floating_ip_per_hour
               FROM price_catalog WHERE currency = $1 ORDER BY created_at DESC LIMIT 1"#,
        )
        .bind(currency)
        .fetch_optional(&self.pool)
        .await
        .map_err(PricingError::Database)?;

        row.map(row_to_entry).transpose()
    }

    pub async fn get_by_version(&self, price_version: &str) -> PricingResult<Option<PriceCatalogEntry>> {
        let row = sqlx::query(
            r#"SELECT price_version, currency, compute, disk_per_gb_hour, floating_ip_per_hour
               FROM price_catalog WHERE price_version = $1"#,
        )
        .bind(price_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(PricingError::Database)?;

        row.map(row_to_entry).transpose()
    }

    pub async fn history(&self, currency: &str) -> PricingResult<Vec<PriceCatalogEntry>> {
        let rows = sqlx::query(
            r#"SELECT price_version, currency, compute, disk_per_gb_hour, floating_ip_per_hour
               FROM price_catalog WHERE currency = $1 ORDER BY created_at DESC"#,
        )
        .bind(currency)
        .fetch_all(&self.pool)
        .await
        .map_err(PricingError::Database)?;

        rows.into_iter().map(row_to_entry).collect()
    }

    async fn insert(&self, entry: &PriceCatalogEntry, at: DateTime<Utc>) -> PricingResult<()> {
        let compute_json =
            serde_json::to_value(&entry.compute).map_err(|e| PricingError::Database(sqlx::Error::Decode(Box::new(e))))?;

        sqlx::query(
            r#"INSERT INTO price_catalog (price_version, currency, compute, disk_per_gb_hour, floating_ip_per_hour, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&entry.price_version)
        .bind(&entry.currency)
        .bind(compute_json)
        .bind(entry.disk_per_gb_hour)
        .bind(entry.floating_ip_per_hour)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(PricingError::Database)?;

        Ok(())
    }

    /// `YYYY-MM-DD_vN`, `N` the count of versions already minted today plus one.
    async fn generate_version(&self, at: DateTime<Utc>) -> PricingResult<String> {
        let day = at.format("%Y-%m-%d").to_string();
        let pattern = format!("{day}_v%");

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM price_catalog WHERE price_version LIKE $1")
            .bind(&pattern)
            .fetch_one(&self.pool)
            .await
            .map_err(PricingError::Database)?
            .try_get("n")
            .map_err(PricingError::Database)?;

        Ok(format!("{day}_v{}", count + 1))
    }
}

fn row_to_entry(row: sqlx::postgres::PgRow) -> PricingResult<PriceCatalogEntry> {
    let compute_json: serde_json::Value = row.try_get("compute").map_err(PricingError::Database)?;
    let compute: HashMap<String, ComputeRate> =
        serde_json::from_value(compute_json).map_err(|e| PricingError::Database(sqlx::Error::Decode(Box::new(e))))?;

    Ok(PriceCatalogEntry {
        currency: row.try_get("currency").map_err(PricingError::Database)?,
        compute,
        disk_per_gb_hour: row.try_get("disk_per_gb_hour").map_err(PricingError::Database)?,
        floating_ip_per_hour: row.try_get("floating_ip_per_hour").map_err(PricingError::Database)?,
        price_version: row.try_get("price_version").map_err(PricingError::Database)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_rate_falls_back_to_others() {
        let mut compute = HashMap::new();
        compute.insert("others".to_string(), ComputeRate { per_hour: Decimal::new(5, 2) });
        let entry = PriceCatalogEntry {
            currency: "USD".to_string(),
            compute,
            disk_per_gb_hour: Decimal::ZERO,
            floating_ip_per_hour: Decimal::ZERO,
            price_version: "2026-01-01_v1".to_string(),
        };
        assert_eq!(entry.compute_rate("unknown-flavor"), Decimal::new(5, 2));
    }
}
