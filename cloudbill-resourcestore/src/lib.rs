//! Event-sourced projection store: every mutation reads the current row,
//! appends an event to its log, and writes the new projection back. No
//! separate event table — the log travels with the resource, mirroring the
//! embedded-document shape the normalizer's events are collected for.

mod compute;
mod disk;
mod floating_ip;

pub use compute::*;
pub use disk::*;
pub use floating_ip::*;

use cloudbill_errors::StoreError;
use sqlx::PgPool;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone)]
pub struct ResourceStore {
    pool: PgPool,
}

impl ResourceStore {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(StoreError::Database)?;
        Self::from_pool(pool).await
    }

    /// Shares a pool with sibling stores (wallet, pricing, bills), running
    /// this crate's own schema migration against it.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        Self::initialize_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn initialize_schema(pool: &PgPool) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS compute_resources (
                resource_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                state TEXT NOT NULL,
                current_flavor TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                deleted_at TIMESTAMPTZ,
                last_billed_until TIMESTAMPTZ NOT NULL,
                events JSONB NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_compute_resources_user ON compute_resources(user_id);

            CREATE TABLE IF NOT EXISTS disk_resources (
                resource_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                size_gb BIGINT NOT NULL,
                state TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                deleted_at TIMESTAMPTZ,
                last_billed_until TIMESTAMPTZ NOT NULL,
                events JSONB NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_disk_resources_user ON disk_resources(user_id);

            CREATE TABLE IF NOT EXISTS floating_ip_resources (
                resource_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                ip_address TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                released_at TIMESTAMPTZ,
                last_billed_until TIMESTAMPTZ NOT NULL,
                events JSONB NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_floating_ip_resources_user ON floating_ip_resources(user_id);
            "#,
        )
        .execute(pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(())
    }
}

fn next_event_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..8])
}
