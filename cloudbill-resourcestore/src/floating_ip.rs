use crate::{next_event_id, ResourceStore, StoreResult};
use chrono::{DateTime, Utc};
use cloudbill_errors::StoreError;
use cloudbill_models::{EventEntry, FloatingIpResource};
use sqlx::Row;

impl ResourceStore {
    pub async fn create_floating_ip(
        &self,
        resource_id: &str,
        user_id: &str,
        ip_address: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<FloatingIpResource> {
        if self.get_floating_ip(resource_id).await?.is_some() {
            return Err(StoreError::Conflict {
                resource_id: resource_id.to_string(),
            });
        }

        let event = EventEntry {
            event_id: next_event_id("evt_ip"),
            time: at,
            event_type: "create".to_string(),
            meta: Default::default(),
        };
        let events = serde_json::to_value(vec![&event]).map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;

        sqlx::query(
            r#"
            INSERT INTO floating_ip_resources
                (resource_id, user_id, ip_address, created_at, released_at, last_billed_until, events)
            VALUES ($1, $2, $3, $4, NULL, $4, $5)
            "#,
        )
        .bind(resource_id)
        .bind(user_id)
        .bind(ip_address)
        .bind(at)
        .bind(events)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(FloatingIpResource {
            resource_id: resource_id.to_string(),
            user_id: user_id.to_string(),
            ip_address: ip_address.to_string(),
            created_at: at,
            released_at: None,
            last_billed_until: at,
            events: vec![event],
        })
    }

    pub async fn get_floating_ip(&self, resource_id: &str) -> StoreResult<Option<FloatingIpResource>> {
        let row = sqlx::query(
            r#"SELECT resource_id, user_id, ip_address, created_at, released_at, last_billed_until, events
               FROM floating_ip_resources WHERE resource_id = $1"#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        row.map(row_to_floating_ip).transpose()
    }

    pub async fn get_floating_ip_by_user(
        &self,
        user_id: &str,
        include_released: bool,
    ) -> StoreResult<Vec<FloatingIpResource>> {
        let query = if include_released {
            r#"SELECT resource_id, user_id, ip_address, created_at, released_at, last_billed_until, events
               FROM floating_ip_resources WHERE user_id = $1 ORDER BY created_at"#
        } else {
            r#"SELECT resource_id, user_id, ip_address, created_at, released_at, last_billed_until, events
               FROM floating_ip_resources WHERE user_id = $1 AND released_at IS NULL ORDER BY created_at"#
        };

        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        rows.into_iter().map(row_to_floating_ip).collect()
    }

    /// Idempotent: releasing an already-released IP is a no-op (spec §4.2).
    /// Reads the row with `FOR UPDATE` and writes it back in the same
    /// transaction; see `compute.rs::update_compute` for why.
    pub async fn release_floating_ip(
        &self,
        resource_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<FloatingIpResource> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;
        let mut resource = lock_floating_ip(&mut tx, resource_id).await?.ok_or_else(|| StoreError::NotFound {
            resource_id: resource_id.to_string(),
        })?;

        if resource.is_released() {
            tx.commit().await.map_err(StoreError::Database)?;
            return Ok(resource);
        }

        resource.released_at = Some(at);
        resource.events.push(EventEntry {
            event_id: next_event_id("evt_ip"),
            time: at,
            event_type: "released".to_string(),
            meta: Default::default(),
        });

        let events = serde_json::to_value(&resource.events)
            .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;

        sqlx::query("UPDATE floating_ip_resources SET released_at = $2, events = $3 WHERE resource_id = $1")
            .bind(resource_id)
            .bind(resource.released_at)
            .bind(events)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Database)?;

        tx.commit().await.map_err(StoreError::Database)?;
        Ok(resource)
    }

    pub async fn update_floating_ip_last_billed(
        &self,
        resource_id: &str,
        until: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE floating_ip_resources SET last_billed_until = $2 WHERE resource_id = $1")
            .bind(resource_id)
            .bind(until)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        Ok(())
    }
}

/// Reads a floating IP with `FOR UPDATE`, taking a row lock that's held
/// until the caller's transaction commits or rolls back.
async fn lock_floating_ip(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    resource_id: &str,
) -> StoreResult<Option<FloatingIpResource>> {
    let row = sqlx::query(
        r#"SELECT resource_id, user_id, ip_address, created_at, released_at, last_billed_until, events
           FROM floating_ip_resources WHERE resource_id = $1 FOR UPDATE"#,
    )
    .bind(resource_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(StoreError::Database)?;

    row.map(row_to_floating_ip).transpose()
}

fn row_to_floating_ip(row: sqlx::postgres::PgRow) -> StoreResult<FloatingIpResource> {
    let events_json: serde_json::Value = row.try_get("events").map_err(StoreError::Database)?;
    let events: Vec<EventEntry> =
        serde_json::from_value(events_json).map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;

    Ok(FloatingIpResource {
        resource_id: row.try_get("resource_id").map_err(StoreError::Database)?,
        user_id: row.try_get("user_id").map_err(StoreError::Database)?,
        ip_address: row.try_get("ip_address").map_err(StoreError::Database)?,
        created_at: row.try_get("created_at").map_err(StoreError::Database)?,
        released_at: row.try_get("released_at").map_err(StoreError::Database)?,
        last_billed_until: row.try_get("last_billed_until").map_err(StoreError::Database)?,
        events,
    })
}
