use crate::{next_event_id, ResourceStore, StoreResult};
use chrono::{DateTime, Utc};
use cloudbill_errors::StoreError;
use cloudbill_models::{ComputeResource, EventEntry};
use serde_json::json;
use sqlx::Row;

impl ResourceStore {
    pub async fn create_compute(
        &self,
        resource_id: &str,
        user_id: &str,
        flavor: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<ComputeResource> {
        if self.get_compute(resource_id).await?.is_some() {
            return Err(StoreError::Conflict {
                resource_id: resource_id.to_string(),
            });
        }

        let event = EventEntry {
            event_id: next_event_id("evt"),
            time: at,
            event_type: "create".to_string(),
            meta: [("flavor".to_string(), json!(flavor))].into_iter().collect(),
        };
        let events = serde_json::to_value(vec![&event]).map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;

        sqlx::query(
            r#"
            INSERT INTO compute_resources
                (resource_id, user_id, state, current_flavor, created_at, deleted_at, last_billed_until, events)
            VALUES ($1, $2, 'running', $3, $4, NULL, $4, $5)
            "#,
        )
        .bind(resource_id)
        .bind(user_id)
        .bind(flavor)
        .bind(at)
        .bind(events)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        Ok(ComputeResource {
            resource_id: resource_id.to_string(),
            user_id: user_id.to_string(),
            state: "running".to_string(),
            current_flavor: flavor.to_string(),
            created_at: at,
            deleted_at: None,
            last_billed_until: at,
            events: vec![event],
        })
    }

    pub async fn get_compute(&self, resource_id: &str) -> StoreResult<Option<ComputeResource>> {
        let row = sqlx::query(
            r#"SELECT resource_id, user_id, state, current_flavor, created_at, deleted_at, last_billed_until, events
               FROM compute_resources WHERE resource_id = $1"#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        row.map(row_to_compute).transpose()
    }

    pub async fn get_compute_by_user(
        &self,
        user_id: &str,
        include_deleted: bool,
    ) -> StoreResult<Vec<ComputeResource>> {
        let query = if include_deleted {
            r#"SELECT resource_id, user_id, state, current_flavor, created_at, deleted_at, last_billed_until, events
               FROM compute_resources WHERE user_id = $1 ORDER BY created_at"#
        } else {
            r#"SELECT resource_id, user_id, state, current_flavor, created_at, deleted_at, last_billed_until, events
               FROM compute_resources WHERE user_id = $1 AND deleted_at IS NULL ORDER BY created_at"#
        };

        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        rows.into_iter().map(row_to_compute).collect()
    }

    /// `state = deleted` takes the delete branch regardless of `flavor`; otherwise
    /// a present `flavor` is always a resize, and a bare `state` updates state.
    ///
    /// Reads the row with `FOR UPDATE` and writes it back in the same
    /// transaction, so two events for the same resource processed
    /// concurrently (spec: per-resource order isn't preserved across a
    /// batch) serialize instead of one silently overwriting the other's
    /// appended event.
    pub async fn update_compute(
        &self,
        resource_id: &str,
        state: Option<&str>,
        flavor: Option<&str>,
        at: DateTime<Utc>,
    ) -> StoreResult<ComputeResource> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;
        let mut resource = lock_compute(&mut tx, resource_id).await?.ok_or_else(|| StoreError::NotFound {
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
                event_id: next_event_id("evt"),
                time: at,
                event_type: "deleted".to_string(),
                meta: Default::default(),
            }
        } else if let Some(flavor) = flavor {
            resource.current_flavor = flavor.to_string();
            EventEntry {
                event_id: next_event_id("evt"),
                time: at,
                event_type: "resize".to_string(),
                meta: [("flavor".to_string(), json!(flavor))].into_iter().collect(),
            }
        } else if let Some(state) = state {
            resource.state = state.to_string();
            EventEntry {
                event_id: next_event_id("evt"),
                time: at,
                event_type: state.to_string(),
                meta: Default::default(),
            }
        } else {
            tx.commit().await.map_err(StoreError::Database)?;
            return Ok(resource);
        };

        resource.events.push(event);
        persist_compute(&mut tx, &resource).await?;
        tx.commit().await.map_err(StoreError::Database)?;
        Ok(resource)
    }

    pub async fn delete_compute(&self, resource_id: &str, at: DateTime<Utc>) -> StoreResult<ComputeResource> {
        self.update_compute(resource_id, Some("deleted"), None, at).await
    }

    pub async fn update_compute_last_billed(
        &self,
        resource_id: &str,
        until: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE compute_resources SET last_billed_until = $2 WHERE resource_id = $1")
            .bind(resource_id)
            .bind(until)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;
        Ok(())
    }

}

/// Reads a compute resource with `FOR UPDATE`, taking a row lock that's
/// held until the caller's transaction commits or rolls back.
async fn lock_compute(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, resource_id: &str) -> StoreResult<Option<ComputeResource>> {
    let row = sqlx::query(
        r#"SELECT resource_id, user_id, state, current_flavor, created_at, deleted_at, last_billed_until, events
           FROM compute_resources WHERE resource_id = $1 FOR UPDATE"#,
    )
    .bind(resource_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(StoreError::Database)?;

    row.map(row_to_compute).transpose()
}

async fn persist_compute(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, resource: &ComputeResource) -> StoreResult<()> {
    let events = serde_json::to_value(&resource.events)
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;

    sqlx::query(
        r#"
        UPDATE compute_resources
        SET state = $2, current_flavor = $3, deleted_at = $4, events = $5
        WHERE resource_id = $1
        "#,
    )
    .bind(&resource.resource_id)
    .bind(&resource.state)
    .bind(&resource.current_flavor)
    .bind(resource.deleted_at)
    .bind(events)
    .execute(&mut **tx)
    .await
    .map_err(StoreError::Database)?;

    Ok(())
}

fn row_to_compute(row: sqlx::postgres::PgRow) -> StoreResult<ComputeResource> {
    let events_json: serde_json::Value = row.try_get("events").map_err(StoreError::Database)?;
    let events: Vec<EventEntry> =
        serde_json::from_value(events_json).map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;

    Ok(ComputeResource {
        resource_id: row.try_get("resource_id").map_err(StoreError::Database)?,
        user_id: row.try_get("user_id").map_err(StoreError::Database)?,
        state: row.try_get("state").map_err(StoreError::Database)?,
        current_flavor: row.try_get("current_flavor").map_err(StoreError::Database)?,
        created_at: row.try_get("created_at").map_err(StoreError::Database)?,
        deleted_at: row.try_get("deleted_at").map_err(StoreError::Database)?,
        last_billed_until: row.try_get("last_billed_until").map_err(StoreError::Database)?,
        events,
    })
}
