//! Key-value pairs and the notification delivery ledger.

use crate::models::{new_id, now_rfc3339, KeyValuePairRow, NotificationDeliveryRow};

use super::{with_timeout, Store, StoreError, StoreResult};

impl Store {
    // ─── Key-value pairs ─────────────────────────────────────────────────

    pub async fn set_kv(
        &self,
        scope: &str,
        name: &str,
        value: &str,
        secret: bool,
        expire_timestamp: Option<&str>,
    ) -> StoreResult<KeyValuePairRow> {
        sqlx::query(
            "INSERT INTO key_value_pairs (id, scope, name, value, secret, expire_timestamp)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (scope, name) DO UPDATE SET
                 value            = excluded.value,
                 secret           = excluded.secret,
                 expire_timestamp = excluded.expire_timestamp",
        )
        .bind(new_id())
        .bind(scope)
        .bind(name)
        .bind(value)
        .bind(secret)
        .bind(expire_timestamp)
        .execute(&self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, &format!("{scope}:{name}")))?;
        self.get_kv(scope, name).await
    }

    pub async fn get_kv(&self, scope: &str, name: &str) -> StoreResult<KeyValuePairRow> {
        sqlx::query_as("SELECT * FROM key_value_pairs WHERE scope = ? AND name = ?")
            .bind(scope)
            .bind(name)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("key {scope}:{name}")))
    }

    pub async fn list_kv_by_scope(&self, scope: &str) -> StoreResult<Vec<KeyValuePairRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM key_value_pairs WHERE scope = ? ORDER BY name ASC",
            )
            .bind(scope)
            .fetch_all(&self.pool())
            .await?)
        })
        .await
    }

    pub async fn delete_kv(&self, scope: &str, name: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM key_value_pairs WHERE scope = ? AND name = ?")
            .bind(scope)
            .bind(name)
            .execute(&self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("key {scope}:{name}")));
        }
        Ok(())
    }

    pub async fn delete_expired_kv(&self, now: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM key_value_pairs WHERE expire_timestamp IS NOT NULL AND expire_timestamp < ?",
        )
        .bind(now)
        .execute(&self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    // ─── Notification deliveries ─────────────────────────────────────────

    /// Record a delivery attempt for `(execution_id, route)`. The unique
    /// index makes emission at-most-once: a second insert for the same pair
    /// fails with `Duplicate` and the notifier skips the route.
    pub async fn record_notification_delivery(
        &self,
        execution_id: &str,
        route: &str,
        status: &str,
    ) -> StoreResult<NotificationDeliveryRow> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO notification_deliveries (id, execution_id, route, status, attempts, created_at)
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(&id)
        .bind(execution_id)
        .bind(route)
        .bind(status)
        .bind(now_rfc3339())
        .execute(&self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, &format!("delivery {execution_id}/{route}")))?;
        self.get_notification_delivery(execution_id, route).await
    }

    pub async fn update_notification_delivery(
        &self,
        execution_id: &str,
        route: &str,
        status: &str,
        attempts: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE notification_deliveries SET status = ?, attempts = ?
             WHERE execution_id = ? AND route = ?",
        )
        .bind(status)
        .bind(attempts)
        .bind(execution_id)
        .bind(route)
        .execute(&self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_notification_delivery(
        &self,
        execution_id: &str,
        route: &str,
    ) -> StoreResult<NotificationDeliveryRow> {
        sqlx::query_as(
            "SELECT * FROM notification_deliveries WHERE execution_id = ? AND route = ?",
        )
        .bind(execution_id)
        .bind(route)
        .fetch_optional(&self.pool())
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("delivery {execution_id}/{route}")))
    }
}
