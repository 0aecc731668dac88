//! Rules and registered actions.

use serde_json::Value;

use crate::bus::{exchanges, routing};
use crate::models::{new_id, now_rfc3339, ActionRow, RuleRow};

use super::{with_timeout, Store, StoreError, StoreResult};

impl Store {
    // ─── Rules ───────────────────────────────────────────────────────────

    /// Upsert a rule keyed by `(pack, name)`. Publishes `create` or `update`
    /// on the rule exchange when the bus is bound — the rules engine cache
    /// invalidates on these.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_or_update_rule(
        &self,
        pack: &str,
        name: &str,
        enabled: bool,
        trigger_ref: &str,
        criteria: &Value,
        action_ref: &str,
        action_parameters: &Value,
        context: &Value,
    ) -> StoreResult<RuleRow> {
        let ref_ = format!("{pack}.{name}");
        let existing: Option<RuleRow> = sqlx::query_as("SELECT * FROM rules WHERE ref = ?")
            .bind(&ref_)
            .fetch_optional(&self.pool())
            .await?;

        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO rules (id, ref, pack, name, enabled, trigger_ref, criteria,
                                action_ref, action_parameters, context, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (ref) DO UPDATE SET
                 enabled           = excluded.enabled,
                 trigger_ref       = excluded.trigger_ref,
                 criteria          = excluded.criteria,
                 action_ref        = excluded.action_ref,
                 action_parameters = excluded.action_parameters,
                 context           = excluded.context,
                 updated_at        = excluded.updated_at",
        )
        .bind(new_id())
        .bind(&ref_)
        .bind(pack)
        .bind(name)
        .bind(enabled)
        .bind(trigger_ref)
        .bind(criteria.to_string())
        .bind(action_ref)
        .bind(action_parameters.to_string())
        .bind(context.to_string())
        .bind(&now)
        .execute(&self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, &ref_))?;

        let row = self.get_rule_by_ref(&ref_).await?;
        if let Some(bus) = self.bound_bus().await {
            let key = if existing.is_some() {
                routing::UPDATE
            } else {
                routing::CREATE
            };
            let _ = bus
                .publish(exchanges::RULE, key, serde_json::to_value(&row).unwrap_or_default())
                .await;
        }
        Ok(row)
    }

    pub async fn get_rule_by_ref(&self, ref_: &str) -> StoreResult<RuleRow> {
        sqlx::query_as("SELECT * FROM rules WHERE ref = ?")
            .bind(ref_)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("rule {ref_}")))
    }

    pub async fn get_rule_by_id(&self, id: &str) -> StoreResult<RuleRow> {
        sqlx::query_as("SELECT * FROM rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("rule {id}")))
    }

    /// Candidate rules for one trigger ref: enabled only.
    pub async fn list_enabled_rules_for_trigger(
        &self,
        trigger_ref: &str,
    ) -> StoreResult<Vec<RuleRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM rules WHERE trigger_ref = ? AND enabled = 1 ORDER BY ref ASC",
            )
            .bind(trigger_ref)
            .fetch_all(&self.pool())
            .await?)
        })
        .await
    }

    pub async fn delete_rule(&self, ref_: &str) -> StoreResult<()> {
        let row = self.get_rule_by_ref(ref_).await?;
        let result = sqlx::query("DELETE FROM rules WHERE ref = ?")
            .bind(ref_)
            .execute(&self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("rule {ref_}")));
        }
        if let Some(bus) = self.bound_bus().await {
            let _ = bus
                .publish(
                    exchanges::RULE,
                    routing::DELETE,
                    serde_json::to_value(&row).unwrap_or_default(),
                )
                .await;
        }
        Ok(())
    }

    // ─── Actions ─────────────────────────────────────────────────────────

    /// Register an action binding a ref to a runner type. Idempotent upsert.
    pub async fn register_action(
        &self,
        pack: &str,
        name: &str,
        runner_type: &str,
        parameters: &Value,
        notify: Option<&Value>,
    ) -> StoreResult<ActionRow> {
        let ref_ = format!("{pack}.{name}");
        sqlx::query(
            "INSERT INTO actions (id, ref, pack, name, enabled, runner_type, parameters, notify, created_at)
             VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?)
             ON CONFLICT (ref) DO UPDATE SET
                 runner_type = excluded.runner_type,
                 parameters  = excluded.parameters,
                 notify      = excluded.notify",
        )
        .bind(new_id())
        .bind(&ref_)
        .bind(pack)
        .bind(name)
        .bind(runner_type)
        .bind(parameters.to_string())
        .bind(notify.map(|n| n.to_string()))
        .bind(now_rfc3339())
        .execute(&self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, &ref_))?;
        self.get_action_by_ref(&ref_).await
    }

    pub async fn get_action_by_ref(&self, ref_: &str) -> StoreResult<ActionRow> {
        sqlx::query_as("SELECT * FROM actions WHERE ref = ?")
            .bind(ref_)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("action {ref_}")))
    }
}
