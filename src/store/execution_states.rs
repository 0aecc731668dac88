//! Tracker state records for asynchronous executions.

use serde_json::Value;

use crate::models::{new_id, now_rfc3339, ActionExecutionStateRow};

use super::{with_timeout, Store, StoreError, StoreResult};

impl Store {
    pub async fn create_execution_state(
        &self,
        execution_id: &str,
        query_module: &str,
        query_context: &Value,
    ) -> StoreResult<ActionExecutionStateRow> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO action_execution_states
                 (id, execution_id, query_module, query_context, retry_count, created_at)
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(execution_id)
        .bind(query_module)
        .bind(query_context.to_string())
        .bind(now_rfc3339())
        .execute(&self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, execution_id))?;
        self.get_execution_state(&id).await
    }

    pub async fn get_execution_state(&self, id: &str) -> StoreResult<ActionExecutionStateRow> {
        sqlx::query_as("SELECT * FROM action_execution_states WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("execution state {id}")))
    }

    /// States whose paired execution is still `running` — the tracker's work
    /// list.
    pub async fn list_states_for_running_executions(
        &self,
    ) -> StoreResult<Vec<ActionExecutionStateRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT s.* FROM action_execution_states s
                 JOIN action_executions e ON e.id = s.execution_id
                 WHERE e.status = 'running'
                 ORDER BY s.created_at ASC",
            )
            .fetch_all(&self.pool())
            .await?)
        })
        .await
    }

    pub async fn touch_execution_state(
        &self,
        id: &str,
        retry_count: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE action_execution_states SET last_query_time = ?, retry_count = ? WHERE id = ?",
        )
        .bind(now_rfc3339())
        .bind(retry_count)
        .bind(id)
        .execute(&self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_execution_state(&self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM action_execution_states WHERE id = ?")
            .bind(id)
            .execute(&self.pool())
            .await?;
        Ok(())
    }
}
