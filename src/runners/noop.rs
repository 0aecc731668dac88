//! No-op runner: succeeds immediately, echoing its parameters back.

use async_trait::async_trait;
use serde_json::json;

use crate::models::ExecutionStatus;

use super::{ActionRunner, RunOutcome, RunRequest, RunnerError, RUNNER_NOOP};

pub struct NoopRunner;

#[async_trait]
impl ActionRunner for NoopRunner {
    fn name(&self) -> &'static str {
        RUNNER_NOOP
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutcome, RunnerError> {
        Ok(RunOutcome::Complete {
            status: ExecutionStatus::Succeeded,
            result: json!({
                "parameters": request.parameters,
                "succeeded": true,
                "failed": false,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_request;
    use super::*;

    #[tokio::test]
    async fn always_succeeds() {
        let outcome = NoopRunner
            .run(&test_request(json!({"a": 1})))
            .await
            .unwrap();
        let RunOutcome::Complete { status, result } = outcome else {
            panic!("noop is synchronous");
        };
        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(result["parameters"]["a"], 1);
    }
}
