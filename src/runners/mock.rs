//! Mock asynchronous runner used to exercise the results tracker.
//!
//! `run` returns immediately with a `Pending` outcome carrying an external
//! task id; the paired `mock-async` query module (see `tracker::queriers`)
//! reports the final result after a configurable number of polls.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::models::new_id;

use super::{ActionRunner, RunOutcome, RunRequest, RunnerError, RUNNER_MOCK_ASYNC};

pub struct MockAsyncRunner;

#[async_trait]
impl ActionRunner for MockAsyncRunner {
    fn name(&self) -> &'static str {
        RUNNER_MOCK_ASYNC
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutcome, RunnerError> {
        let external_id = request
            .parameters
            .get("external_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(new_id);
        // Polls the querier answers "still running" before completing.
        let polls_until_done = request
            .parameters
            .get("polls_until_done")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let final_result = request
            .parameters
            .get("final_result")
            .cloned()
            .unwrap_or_else(|| json!({"done": true}));
        let fail = request
            .parameters
            .get("fail")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(RunOutcome::Pending {
            partial: json!({"external_id": external_id, "submitted": true}),
            query_module: RUNNER_MOCK_ASYNC.to_string(),
            query_context: json!({
                "external_id": external_id,
                "polls_until_done": polls_until_done,
                "final_result": final_result,
                "fail": fail,
            }),
        })
    }
}
