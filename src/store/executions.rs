//! Live actions and their mirrored action executions.
//!
//! The pair is written transactionally: the live action is the intent, the
//! execution is the status-bearing mirror observers read. Status transitions
//! go through two protocols:
//!
//! * [`Store::claim_live_action`] — atomic update-by-query guarded on the
//!   current status; used by the scheduler and sweeps to win races between
//!   replicas. Losing the race returns `Ok(None)`.
//! * [`Store::update_live_action_status`] — optimistic change-revision
//!   update; the caller supplies the revision it read and gets
//!   `WriteConflict` if another writer got there first.

use serde_json::Value;

use crate::models::{
    new_id, now_rfc3339, ActionExecutionRow, ActionRow, ExecutionStatus, LiveActionRow,
};

use super::{with_timeout, Store, StoreError, StoreResult};

/// Filter for execution queries (GC, CLI listings, policy counts).
#[derive(Debug, Default, Clone)]
pub struct ExecutionFilter {
    pub action_ref: Option<String>,
    pub statuses: Vec<ExecutionStatus>,
    /// Only executions whose end_timestamp is before this instant.
    pub ended_before: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub newest_first: bool,
}

fn status_in_clause(statuses: &[ExecutionStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Store {
    /// Create the live action + execution pair in one transaction.
    /// The live action starts `requested`; publishing is the caller's job.
    pub async fn create_live_action_pair(
        &self,
        action: &ActionRow,
        parameters: &Value,
        context: &Value,
        trigger_instance_id: Option<&str>,
        rule_id: Option<&str>,
    ) -> StoreResult<(LiveActionRow, ActionExecutionRow)> {
        let liveaction_id = new_id();
        let execution_id = new_id();
        let now = now_rfc3339();
        let notify = action.notify.clone();

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO live_actions (id, action_ref, runner_type, status, parameters, context,
                                       notify, revision, created_at)
             VALUES (?, ?, ?, 'requested', ?, ?, ?, 0, ?)",
        )
        .bind(&liveaction_id)
        .bind(&action.ref_)
        .bind(&action.runner_type)
        .bind(parameters.to_string())
        .bind(context.to_string())
        .bind(&notify)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_write(e, &action.ref_))?;

        sqlx::query(
            "INSERT INTO action_executions (id, liveaction_id, action_ref, runner_type, status,
                                            parameters, context, trigger_instance_id, rule_id,
                                            created_at)
             VALUES (?, ?, ?, ?, 'requested', ?, ?, ?, ?, ?)",
        )
        .bind(&execution_id)
        .bind(&liveaction_id)
        .bind(&action.ref_)
        .bind(&action.runner_type)
        .bind(parameters.to_string())
        .bind(context.to_string())
        .bind(trigger_instance_id)
        .bind(rule_id)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_write(e, &action.ref_))?;
        tx.commit().await?;

        let live = self.get_live_action(&liveaction_id).await?;
        let exec = self.get_execution(&execution_id).await?;
        Ok((live, exec))
    }

    pub async fn get_live_action(&self, id: &str) -> StoreResult<LiveActionRow> {
        sqlx::query_as("SELECT * FROM live_actions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("live action {id}")))
    }

    pub async fn get_execution(&self, id: &str) -> StoreResult<ActionExecutionRow> {
        sqlx::query_as("SELECT * FROM action_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))
    }

    pub async fn get_execution_for_liveaction(
        &self,
        liveaction_id: &str,
    ) -> StoreResult<ActionExecutionRow> {
        sqlx::query_as("SELECT * FROM action_executions WHERE liveaction_id = ?")
            .bind(liveaction_id)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("execution for live action {liveaction_id}")))
    }

    /// Atomically claim a status transition: the UPDATE is guarded on the id
    /// and the allowed current statuses. Returns `None` when another claimant
    /// already moved the row (a silent no-op for the caller).
    pub async fn claim_live_action(
        &self,
        id: &str,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> StoreResult<Option<LiveActionRow>> {
        debug_assert!(from.iter().all(|f| f.can_transition_to(to)));
        let now = now_rfc3339();
        let in_clause = status_in_clause(from);
        let set_start = if to == ExecutionStatus::Running {
            ", start_timestamp = ?2"
        } else {
            ""
        };
        let set_end = if to.is_terminal() {
            ", end_timestamp = ?2"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE live_actions SET status = ?1, revision = revision + 1{set_start}{set_end}
             WHERE id = ?3 AND status IN ({in_clause})"
        );
        let result = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(&now)
            .bind(id)
            .execute(&self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.mirror_execution_status(id).await?;
        Ok(Some(self.get_live_action(id).await?))
    }

    /// Optimistic status transition. `expected_revision` is the revision the
    /// caller read; a stale value fails with `WriteConflict`. Terminal states
    /// freeze the result and set `end_timestamp`.
    pub async fn update_live_action_status(
        &self,
        id: &str,
        expected_revision: i64,
        to: ExecutionStatus,
        result: Option<&Value>,
        runner_info: Option<&Value>,
    ) -> StoreResult<LiveActionRow> {
        let current = self.get_live_action(id).await?;
        let current_status = current
            .status_enum()
            .ok_or_else(|| StoreError::Malformed(format!("live action {id} has unknown status")))?;
        if !current_status.can_transition_to(to) {
            return Err(StoreError::Malformed(format!(
                "illegal transition {current_status} -> {to} for live action {id}"
            )));
        }

        let now = now_rfc3339();
        let set_start = if to == ExecutionStatus::Running {
            ", start_timestamp = ?2"
        } else {
            ""
        };
        let set_end = if to.is_terminal() {
            ", end_timestamp = ?2"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE live_actions
             SET status = ?1, revision = revision + 1,
                 result = COALESCE(?4, result),
                 runner_info = COALESCE(?5, runner_info){set_start}{set_end}
             WHERE id = ?3 AND revision = ?6"
        );
        let outcome = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(&now)
            .bind(id)
            .bind(result.map(|r| r.to_string()))
            .bind(runner_info.map(|r| r.to_string()))
            .bind(expected_revision)
            .execute(&self.pool())
            .await?;
        if outcome.rows_affected() == 0 {
            return Err(StoreError::WriteConflict(format!(
                "live action {id} revision {expected_revision} is stale"
            )));
        }
        self.mirror_execution_status(id).await?;
        self.get_live_action(id).await
    }

    /// Record runner-side bookkeeping (partial results from asynchronous
    /// runners) without touching the status machine.
    pub async fn update_live_action_runner_info(
        &self,
        id: &str,
        runner_info: &Value,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE live_actions SET runner_info = ? WHERE id = ?")
            .bind(runner_info.to_string())
            .bind(id)
            .execute(&self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("live action {id}")));
        }
        Ok(())
    }

    /// Copy status/result/timestamps from the live action onto its mirror.
    async fn mirror_execution_status(&self, liveaction_id: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE action_executions
             SET status = (SELECT status FROM live_actions WHERE id = ?1),
                 result = (SELECT result FROM live_actions WHERE id = ?1),
                 start_timestamp = (SELECT start_timestamp FROM live_actions WHERE id = ?1),
                 end_timestamp = (SELECT end_timestamp FROM live_actions WHERE id = ?1)
             WHERE liveaction_id = ?1",
        )
        .bind(liveaction_id)
        .execute(&self.pool())
        .await?;
        Ok(())
    }

    /// In-flight count used by the concurrency policy: executions holding
    /// capacity for the action (`scheduled`, `running`, `canceling`),
    /// excluding the candidate itself.
    pub async fn count_in_flight(
        &self,
        action_ref: &str,
        exclude_id: &str,
    ) -> StoreResult<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM live_actions
             WHERE action_ref = ? AND id != ?
               AND status IN ('scheduled', 'running', 'canceling')",
        )
        .bind(action_ref)
        .bind(exclude_id)
        .fetch_one(&self.pool())
        .await?;
        Ok(row.0)
    }

    pub async fn list_live_actions_by_status(
        &self,
        status: ExecutionStatus,
        created_before: Option<&str>,
        limit: i64,
    ) -> StoreResult<Vec<LiveActionRow>> {
        with_timeout(async {
            let rows = match created_before {
                Some(cutoff) => {
                    sqlx::query_as(
                        "SELECT * FROM live_actions WHERE status = ? AND created_at < ?
                         ORDER BY created_at ASC LIMIT ?",
                    )
                    .bind(status.as_str())
                    .bind(cutoff)
                    .bind(limit)
                    .fetch_all(&self.pool())
                    .await?
                }
                None => {
                    sqlx::query_as(
                        "SELECT * FROM live_actions WHERE status = ?
                         ORDER BY created_at ASC LIMIT ?",
                    )
                    .bind(status.as_str())
                    .bind(limit)
                    .fetch_all(&self.pool())
                    .await?
                }
            };
            Ok(rows)
        })
        .await
    }

    /// Filtered execution listing.
    pub async fn query_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> StoreResult<Vec<ActionExecutionRow>> {
        let mut sql = String::from("SELECT * FROM action_executions WHERE 1 = 1");
        if filter.action_ref.is_some() {
            sql.push_str(" AND action_ref = ?");
        }
        if !filter.statuses.is_empty() {
            sql.push_str(&format!(
                " AND status IN ({})",
                status_in_clause(&filter.statuses)
            ));
        }
        if filter.ended_before.is_some() {
            sql.push_str(" AND end_timestamp IS NOT NULL AND end_timestamp < ?");
        }
        sql.push_str(if filter.newest_first {
            " ORDER BY created_at DESC"
        } else {
            " ORDER BY created_at ASC"
        });
        sql.push_str(&format!(
            " LIMIT {} OFFSET {}",
            filter.limit.unwrap_or(1000),
            filter.offset.unwrap_or(0)
        ));

        let mut query = sqlx::query_as::<_, ActionExecutionRow>(&sql);
        if let Some(action_ref) = &filter.action_ref {
            query = query.bind(action_ref.clone());
        }
        if let Some(cutoff) = &filter.ended_before {
            query = query.bind(cutoff.clone());
        }
        with_timeout(async { Ok(query.fetch_all(&self.pool()).await?) }).await
    }

    /// GC phase (b): terminal executions (and their live actions) older than
    /// the cutoff.
    pub async fn delete_terminal_executions_older_than(&self, cutoff: &str) -> StoreResult<u64> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "DELETE FROM live_actions WHERE id IN (
                 SELECT liveaction_id FROM action_executions
                 WHERE status IN ('succeeded', 'failed', 'canceled')
                   AND end_timestamp IS NOT NULL AND end_timestamp < ?
             )",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "DELETE FROM action_executions
             WHERE status IN ('succeeded', 'failed', 'canceled')
               AND end_timestamp IS NOT NULL AND end_timestamp < ?",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
