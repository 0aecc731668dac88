//! Runner type metadata, bootstrapped at startup.

use serde_json::Value;

use crate::models::{new_id, now_rfc3339, RunnerTypeRow};

use super::{with_timeout, Store, StoreError, StoreResult};

impl Store {
    pub async fn register_runner_type(
        &self,
        name: &str,
        runner_module: &str,
        runner_parameters: &Value,
    ) -> StoreResult<RunnerTypeRow> {
        sqlx::query(
            "INSERT INTO runner_types (id, name, runner_module, runner_parameters, enabled, created_at)
             VALUES (?, ?, ?, ?, 1, ?)
             ON CONFLICT (name) DO UPDATE SET
                 runner_module     = excluded.runner_module,
                 runner_parameters = excluded.runner_parameters",
        )
        .bind(new_id())
        .bind(name)
        .bind(runner_module)
        .bind(runner_parameters.to_string())
        .bind(now_rfc3339())
        .execute(&self.pool())
        .await
        .map_err(|e| StoreError::from_write(e, name))?;
        self.get_runner_type(name).await
    }

    pub async fn get_runner_type(&self, name: &str) -> StoreResult<RunnerTypeRow> {
        sqlx::query_as("SELECT * FROM runner_types WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("runner type {name}")))
    }

    pub async fn list_runner_types(&self) -> StoreResult<Vec<RunnerTypeRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM runner_types WHERE enabled = 1 ORDER BY name ASC")
                    .fetch_all(&self.pool())
                    .await?,
            )
        })
        .await
    }
}
