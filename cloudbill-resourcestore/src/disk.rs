use crate::{next_event_id, ResourceStore, StoreResult};
use chrono::{DateTime, Utc};
use cloudbill_errors::StoreError;
use cloudbill_models::{DiskResource, EventEntry};
use serde_json::json;
use sqlx::Row;

impl ResourceStore {
    pub async fn create_disk(
        &self,
        resource_id: &str,
        user_id: &str,
        size_gb: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<DiskResource> {
        if self.get_disk(resource_id).await?.is_some() {
            return Err(StoreError::Conflict {
                resource_id: resource_id.to_string(),
            });
        }

        let event = EventEntry {
            event_id: next_event_id("evt_d"),
            time: at,
            event_type: "create".to_string(),
            meta: [("size_gb".to_string(), json!(size_gb))].into_iter().collect(),
        };
        let events = serde_json::to_value(vec![&event]).map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;

        sqlx::query(
            r#"
            INSERT INTO disk_resources
                (resource_id, user_id, size_gb, state, created_at, deleted_at, last_billed_until, events)
            VALUES ($1, $2, $3, 'detached', $4, NULL, $4, $5)
            "#,
        )
        .bind(resource_id)
        .bind(user_id)
        .bind(size_gb)
        .bind(at)
        .bind(events)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(DiskResource {
            resource_id: resource_id.to_string(),
            user_id: user_id.to_string(),
            size_gb,
            state: "detached".to_string(),
            created_at: at,
            deleted_at: None,
            last_billed_until: at,
            events: vec![event],
        })
    }

    pub async fn get_disk(&self, resource_id: &str) -> StoreResult<Option<DiskResource>> {
        let row = sqlx::query(
            r#"SELECT resource_id, user_id, size_gb, state, created_at, deleted_at, last_billed_until, events
               FROM disk_resources WHERE resource_id = $1"#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        row.map(row_to_disk).transpose()
    }

    pub async fn get_disk_by_user(&self, user_id: &str, include_deleted: bool) -> StoreResult<Vec<DiskResource>> {
        let query = if include_deleted {
            r#"SELECT resource_id, user_id, size_gb, state, created_at, deleted_at, last_billed_until, events
               FROM disk_resources WHERE user_id = $1 ORDER BY created_at"#
        } else {
            r#"SELECT resource_id, user_id, size_gb, state, created_at, deleted_at, last_billed_until, events
               FROM disk_resources WHERE user_id = $1 AND deleted_at IS NULL ORDER BY created_at"#
        };

        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        rows.into_iter().map(row_to_disk).collect()
    }

    /// `state = deleted` takes the delete branch regardless of `size_gb`; a present
    /// `size_gb` is a resize; a bare `state` (attach/detach) is informational only.
    ///
    /// Reads the row with `FOR UPDATE` and writes it back in the same
    /// transaction; see `compute.rs::update_compute` for why.
    pub async fn update_disk(
        &self,
        resource_id: &str,
        state: Option<&str>,
        size_gb: Option<i64>,
        at: DateTime<Utc>,
    ) -> StoreResult<DiskResource> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;
        let mut resource = lock_disk(&mut tx, resource_id).await?.ok_or_else(|| StoreError::NotFound {
            resource_id: resource_id.to_string(),
        })?;

        if resource.is_deleted() {
            tx.commit().await.map_err(StoreError::Database)?;
            return Ok(resource);
        }

        let event = if state == Some("deleted") {
            resource.deleted_at = Some(at);
            resource.state = "deleted".to_string();
            EventEntry {
                event_id: next_event_id("evt_d"),
                time: at,
                event_type: "deleted".to_string(),
                meta: Default::default(),
            }
        } else if let Some(size_gb) = size_gb {
            resource.size_gb = size_gb;
            EventEntry {
                event_id: next_event_id("evt_d"),
                time: at,
                event_type: "resize".to_string(),
                meta: [("size_gb".to_string(), json!(size_gb))].into_iter().collect(),
            }
        } else if let Some(state) = state {
            resource.state = state.to_string();
            EventEntry {
                event_id: next_event_id("evt_d"),
                time: at,
                event_type: state.to_string(),
                meta: Default::default(),
            }
        } else {
            tx.commit().await.map_err(StoreError::Database)?;
            return Ok(resource);
        };

        resource.events.push(event);
        persist_disk(&mut tx, &resource).await?;
        tx.commit().await.map_err(StoreError::Database)?;
        Ok(resource)
    }

    pub async fn delete_disk(&self, resource_id: &str, at: DateTime<Utc>) -> StoreResult<DiskResource> {
        self.update_disk(resource_id, Some("deleted"), None, at).await
    }

    pub async fn update_disk_last_billed(&self, resource_id: &str, until: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE disk_resources SET last_billed_until = $2 WHERE resource_id = $1")
            .bind(resource_id)
            .bind(until)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        Ok(())
    }

}

async fn lock_disk(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, resource_id: &str) -> StoreResult<Option<DiskResource>> {
    let row = sqlx::query(
        r#"SELECT resource_id, user_id, size_gb, state, created_at, deleted_at, last_billed_until, events
           FROM disk_resources WHERE resource_id = $1 FOR UPDATE"#,
    )
    .bind(resource_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(StoreError::Database)?;

    row.map(row_to_disk).transpose()
}

async fn persist_disk(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, resource: &DiskResource) -> StoreResult<()> {
    let events = serde_json::to_value(&resource.events)
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;

    sqlx::query(
        r#"
        UPDATE disk_resources
        SET state = $2, size_gb = $3, deleted_at = $4, events = $5
        WHERE resource_id = $1
        "#,
    )
    .bind(&resource.resource_id)
    .bind(&resource.state)
    .bind(resource.size_gb)
    .bind(resource.deleted_at)
    .bind(events)
    .execute(&mut **tx)
    .await
    .map_err(StoreError::Database)?;

    Ok(())
}

fn row_to_disk(row: sqlx::postgres::PgRow) -> StoreResult<DiskResource> {
    let events_json: serde_json::Value = row.try_get("events").map_err(StoreError::Database)?;
    let events: Vec<EventEntry> =
        serde_json::from_value(events_json).map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;

    Ok(DiskResource {
        resource_id: row.try_get("resource_id").map_err(StoreError::Database)?,
        user_id: row.try_get("user_id").map_err(StoreError::Database)?,
        size_gb: row.try_get("size_gb").map_err(StoreError::Database)?,
        state: row.try_get("state").map_err(StoreError::Database)?,
        created_at: row.try_get("created_at").map_err(StoreError::Database)?,
        deleted_at: row.try_get("deleted_at").map_err(StoreError::Database)?,
        last_billed_until: row.try_get("last_billed_until").map_err(StoreError::Database)?,
        events,
    })
}
