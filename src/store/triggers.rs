//! Trigger types, triggers and trigger instances.

use serde_json::Value;

use crate::bus::{exchanges, routing};
use crate::models::{new_id, now_rfc3339, TriggerInstanceRow, TriggerInstanceStatus, TriggerRow, TriggerTypeRow};

use super::{with_timeout, Store, StoreError, StoreResult};

impl Store {
    // ─── Trigger types ───────────────────────────────────────────────────

    /// Upsert a trigger type keyed by ref. Idempotent on equal payloads.
    pub async fn add_or_update_trigger_type(
        &self,
        pack: &str,
        name: &str,
        parameters_schema: &Value,
        payload_schema: &Value,
    ) -> StoreResult<TriggerTypeRow> {
        let ref_ = format!("{pack}.{name}");
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO trigger_types (id, ref, pack, name, parameters_schema, payload_schema, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (ref) DO UPDATE SET
                 parameters_schema = excluded.parameters_schema,
                 payload_schema    = excluded.payload_schema",
        )
        .bind(new_id())
        .bind(&ref_)
        .bind(pack)
        .bind(name)
        .bind(parameters_schema.to_string())
        .bind(payload_schema.to_string())
        .bind(&now)
        .execute(&self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, &ref_))?;
        self.get_trigger_type_by_ref(&ref_).await
    }

    pub async fn get_trigger_type_by_ref(&self, ref_: &str) -> StoreResult<TriggerTypeRow> {
        sqlx::query_as("SELECT * FROM trigger_types WHERE ref = ?")
            .bind(ref_)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("trigger type {ref_}")))
    }

    // ─── Triggers ────────────────────────────────────────────────────────

    /// Resolve the trigger for `ref_`, creating it lazily on first reference.
    /// Race-safe: a concurrent create loses on the unique index and falls
    /// back to the stored row.
    pub async fn get_or_create_trigger(
        &self,
        ref_: &str,
        type_ref: &str,
        parameters: &Value,
    ) -> StoreResult<TriggerRow> {
        if let Some(existing) = sqlx::query_as::<_, TriggerRow>("SELECT * FROM triggers WHERE ref = ?")
            .bind(ref_)
            .fetch_optional(&self.pool())
            .await?
        {
            return Ok(existing);
        }

        let insert = sqlx::query(
            "INSERT INTO triggers (id, ref, type_ref, parameters, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(new_id())
        .bind(ref_)
        .bind(type_ref)
        .bind(parameters.to_string())
        .bind(now_rfc3339())
        .execute(&self.pool())
        .await;

        match insert {
            Ok(_) => {
                if let Some(bus) = self.bound_bus().await {
                    let row = self.get_trigger_by_ref(ref_).await?;
                    let _ = bus
                        .publish(exchanges::TRIGGER, routing::CREATE, serde_json::to_value(&row).unwrap_or_default())
                        .await;
                }
            }
            Err(e) => {
                let mapped = StoreError::from_write(e, ref_);
                if !matches!(mapped, StoreError::Duplicate(_)) {
                    return Err(mapped);
                }
                // Lost the race; the winner's row is authoritative.
            }
        }
        self.get_trigger_by_ref(ref_).await
    }

    pub async fn get_trigger_by_ref(&self, ref_: &str) -> StoreResult<TriggerRow> {
        sqlx::query_as("SELECT * FROM triggers WHERE ref = ?")
            .bind(ref_)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("trigger {ref_}")))
    }

    // ─── Trigger instances ───────────────────────────────────────────────

    pub async fn create_trigger_instance(
        &self,
        trigger_ref: &str,
        payload: &Value,
        occurrence_time: &str,
        trace_tag: Option<&str>,
    ) -> StoreResult<TriggerInstanceRow> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO trigger_instances (id, trigger_ref, payload, occurrence_time, status, trace_tag)
             VALUES (?, ?, ?, ?, 'pending', ?)",
        )
        .bind(&id)
        .bind(trigger_ref)
        .bind(payload.to_string())
        .bind(occurrence_time)
        .bind(trace_tag)
        .execute(&self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, trigger_ref))?;
        self.get_trigger_instance(&id).await
    }

    pub async fn get_trigger_instance(&self, id: &str) -> StoreResult<TriggerInstanceRow> {
        sqlx::query_as("SELECT * FROM trigger_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("trigger instance {id}")))
    }

    pub async fn update_trigger_instance_status(
        &self,
        id: &str,
        status: TriggerInstanceStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE trigger_instances SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("trigger instance {id}")));
        }
        Ok(())
    }

    /// Instances persisted but never picked up — the outbox sweep republishes
    /// these.
    pub async fn list_pending_trigger_instances(
        &self,
        older_than: &str,
        limit: i64,
    ) -> StoreResult<Vec<TriggerInstanceRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM trigger_instances
                 WHERE status = 'pending' AND occurrence_time < ?
                 ORDER BY occurrence_time ASC LIMIT ?",
            )
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool())
            .await?)
        })
        .await
    }

    /// GC phase (a): drop instances whose occurrence time fell past the TTL.
    pub async fn delete_trigger_instances_older_than(&self, cutoff: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM trigger_instances WHERE occurrence_time < ?")
            .bind(cutoff)
            .execute(&self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
