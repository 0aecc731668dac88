//! Built-in query modules.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::models::ExecutionStatus;
use crate::runners::RUNNER_MOCK_ASYNC;

use super::{Querier, QuerierError, QueryVerdict};

/// Companion query module for the `mock-async` runner. Counts polls per
/// external id in memory; the `query_context` decides how many polls are
/// answered "still running" before the final result, and whether polls fail.
pub struct MockAsyncQuerier {
    polls: Mutex<HashMap<String, i64>>,
}

impl MockAsyncQuerier {
    pub fn new() -> Self {
        Self {
            polls: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MockAsyncQuerier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Querier for MockAsyncQuerier {
    fn name(&self) -> &'static str {
        RUNNER_MOCK_ASYNC
    }

    async fn query(
        &self,
        _execution_id: &str,
        query_context: &Value,
        _last_query_time: Option<DateTime<Utc>>,
    ) -> Result<QueryVerdict, QuerierError> {
        if query_context
            .get("fail")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(QuerierError::Failed("mock query failure".to_string()));
        }

        let external_id = query_context
            .get("external_id")
            .and_then(Value::as_str)
            .ok_or_else(|| QuerierError::Failed("query context lacks external_id".to_string()))?;
        let polls_until_done = query_context
            .get("polls_until_done")
            .and_then(Value::as_i64)
            .unwrap_or(1);

        let count = {
            let mut polls = self.polls.lock().expect("poll counter mutex poisoned");
            let entry = polls.entry(external_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count < polls_until_done {
            return Ok(QueryVerdict::StillRunning);
        }
        Ok(QueryVerdict::Done {
            status: ExecutionStatus::Succeeded,
            result: query_context
                .get("final_result")
                .cloned()
                .unwrap_or_else(|| json!({"done": true})),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_polls_per_external_id() {
        let querier = MockAsyncQuerier::new();
        let ctx = json!({"external_id": "x1", "polls_until_done": 2, "final_result": {"ok": true}});
        assert!(matches!(
            querier.query("e1", &ctx, None).await.unwrap(),
            QueryVerdict::StillRunning
        ));
        let QueryVerdict::Done { status, result } = querier.query("e1", &ctx, None).await.unwrap()
        else {
            panic!("second poll completes");
        };
        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn fail_flag_produces_query_errors() {
        let querier = MockAsyncQuerier::new();
        let ctx = json!({"external_id": "x2", "fail": true});
        assert!(querier.query("e1", &ctx, None).await.is_err());
    }
}
