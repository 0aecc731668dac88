//! Rule enforcement audit records.

use crate::models::{new_id, now_rfc3339, RuleEnforcementRow};

use super::{with_timeout, Store, StoreError, StoreResult};

impl Store {
    /// Insert an enforcement record. The `(trigger_instance_id, rule_id)`
    /// unique index is the redelivery dedup key: a second attempt for the
    /// same pair fails with `Duplicate` and the caller skips the rule.
    pub async fn create_rule_enforcement(
        &self,
        trigger_instance_id: &str,
        rule_id: &str,
        rule_ref: &str,
        execution_id: Option<&str>,
        status: &str,
        failure_reason: Option<&str>,
    ) -> StoreResult<RuleEnforcementRow> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO rule_enforcements
                 (id, trigger_instance_id, rule_id, rule_ref, execution_id, status,
                  failure_reason, enforced_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(trigger_instance_id)
        .bind(rule_id)
        .bind(rule_ref)
        .bind(execution_id)
        .bind(status)
        .bind(failure_reason)
        .bind(now_rfc3339())
        .execute(&self.pool())
        .await
        .map_err(|e| {
            StoreError::from_write(e, &format!("enforcement {trigger_instance_id}/{rule_id}"))
        })?;
        self.get_rule_enforcement(&id).await
    }

    pub async fn get_rule_enforcement(&self, id: &str) -> StoreResult<RuleEnforcementRow> {
        sqlx::query_as("SELECT * FROM rule_enforcements WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("rule enforcement {id}")))
    }

    pub async fn list_enforcements_for_instance(
        &self,
        trigger_instance_id: &str,
    ) -> StoreResult<Vec<RuleEnforcementRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM rule_enforcements WHERE trigger_instance_id = ?
                 ORDER BY enforced_at ASC",
            )
            .bind(trigger_instance_id)
            .fetch_all(&self.pool())
            .await?)
        })
        .await
    }

    /// GC phase (d): enforcements older than the TTL.
    pub async fn delete_enforcements_older_than(&self, cutoff: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM rule_enforcements WHERE enforced_at < ?")
            .bind(cutoff)
            .execute(&self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
