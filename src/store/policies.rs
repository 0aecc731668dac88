//! Admission-control policies per action.

use serde_json::Value;

use crate::models::{new_id, now_rfc3339, PolicyRow};

use super::{with_timeout, Store, StoreError, StoreResult};

impl Store {
    /// Upsert a policy keyed by `(resource_ref, policy_type, name)`.
    pub async fn add_or_update_policy(
        &self,
        pack: &str,
        name: &str,
        resource_ref: &str,
        policy_type: &str,
        parameters: &Value,
    ) -> StoreResult<PolicyRow> {
        let ref_ = format!("{pack}.{name}");
        sqlx::query(
            "INSERT INTO policies (id, ref, pack, name, enabled, resource_ref, policy_type,
                                   parameters, created_at)
             VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?)
             ON CONFLICT (resource_ref, policy_type, name) DO UPDATE SET
                 enabled    = excluded.enabled,
                 parameters = excluded.parameters",
        )
        .bind(new_id())
        .bind(&ref_)
        .bind(pack)
        .bind(name)
        .bind(resource_ref)
        .bind(policy_type)
        .bind(parameters.to_string())
        .bind(now_rfc3339())
        .execute(&self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, &ref_))?;
        self.get_policy_by_ref(&ref_).await
    }

    pub async fn get_policy_by_ref(&self, ref_: &str) -> StoreResult<PolicyRow> {
        sqlx::query_as("SELECT * FROM policies WHERE ref = ?")
            .bind(ref_)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("policy {ref_}")))
    }

    /// Enabled policies for one action ref, in deterministic (alphabetic by
    /// name) evaluation order.
    pub async fn list_policies_for_resource(
        &self,
        resource_ref: &str,
    ) -> StoreResult<Vec<PolicyRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM policies WHERE resource_ref = ? AND enabled = 1
                 ORDER BY name ASC",
            )
            .bind(resource_ref)
            .fetch_all(&self.pool())
            .await?)
        })
        .await
    }

    pub async fn disable_policy(&self, ref_: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE policies SET enabled = 0 WHERE ref = ?")
            .bind(ref_)
            .execute(&self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("policy {ref_}")));
        }
        Ok(())
    }
}
