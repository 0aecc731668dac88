//! Trace records correlating trigger instances, rules and executions.

use serde_json::{json, Value};

use crate::models::{new_id, now_rfc3339, TraceRow};

use super::{with_timeout, Store, StoreError, StoreResult};

/// Which component list of the trace a ref is appended to.
#[derive(Debug, Clone, Copy)]
pub enum TraceComponent {
    TriggerInstance,
    Rule,
    ActionExecution,
}

impl TraceComponent {
    fn column(&self) -> &'static str {
        match self {
            Self::TriggerInstance => "trigger_instances",
            Self::Rule => "rules",
            Self::ActionExecution => "action_executions",
        }
    }
}

impl Store {
    /// Fetch the trace for a tag, creating it on first use.
    pub async fn get_or_create_trace(&self, trace_tag: &str) -> StoreResult<TraceRow> {
        if let Some(existing) = sqlx::query_as::<_, TraceRow>(
            "SELECT * FROM traces WHERE trace_tag = ? ORDER BY start_timestamp DESC LIMIT 1",
        )
        .bind(trace_tag)
        .fetch_optional(&self.pool())
        .await?
        {
            return Ok(existing);
        }
        let id = new_id();
        sqlx::query(
            "INSERT INTO traces (id, trace_tag, start_timestamp) VALUES (?, ?, ?)",
        )
        .bind(&id)
        .bind(trace_tag)
        .bind(now_rfc3339())
        .execute(&self.pool())
        .await?;
        self.get_trace(&id).await
    }

    pub async fn get_trace(&self, id: &str) -> StoreResult<TraceRow> {
        sqlx::query_as("SELECT * FROM traces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("trace {id}")))
    }

    /// Append a component ref `{id, ref}` to one of the trace's lists.
    pub async fn push_trace_component(
        &self,
        trace_id: &str,
        component: TraceComponent,
        component_id: &str,
        component_ref: &str,
    ) -> StoreResult<()> {
        let trace = self.get_trace(trace_id).await?;
        let raw = match component {
            TraceComponent::TriggerInstance => &trace.trigger_instances,
            TraceComponent::Rule => &trace.rules,
            TraceComponent::ActionExecution => &trace.action_executions,
        };
        let mut list: Vec<Value> = serde_json::from_str(raw).unwrap_or_default();
        list.push(json!({"id": component_id, "ref": component_ref}));
        let sql = format!(
            "UPDATE traces SET {} = ? WHERE id = ?",
            component.column()
        );
        sqlx::query(&sql)
            .bind(serde_json::to_string(&list).unwrap_or_else(|_| "[]".to_string()))
            .bind(trace_id)
            .execute(&self.pool())
            .await?;
        Ok(())
    }

    pub async fn list_traces_by_tag(&self, trace_tag: &str) -> StoreResult<Vec<TraceRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM traces WHERE trace_tag = ? ORDER BY start_timestamp ASC",
            )
            .bind(trace_tag)
            .fetch_all(&self.pool())
            .await?)
        })
        .await
    }

    /// GC phase (d): traces older than the TTL.
    pub async fn delete_traces_older_than(&self, cutoff: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM traces WHERE start_timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
