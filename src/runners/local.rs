//! Local shell command runner.
//!
//! Runs `cmd` through `sh -c`, capturing stdout and stderr. The child is
//! killed when the run future is dropped, which is how worker-side timeouts
//! and cancellations tear the process down.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::models::ExecutionStatus;

use super::{ActionRunner, RunOutcome, RunRequest, RunnerError, RUNNER_LOCAL_SHELL};

pub struct LocalShellRunner;

#[async_trait]
impl ActionRunner for LocalShellRunner {
    fn name(&self) -> &'static str {
        RUNNER_LOCAL_SHELL
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutcome, RunnerError> {
        let cmd = request
            .parameters
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| RunnerError::InvalidParameters("'cmd' is required".to_string()))?;

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = request.parameters.get("cwd").and_then(Value::as_str) {
            command.current_dir(cwd);
        }
        if let Some(env) = request.parameters.get("env").and_then(Value::as_object) {
            for (k, v) in env {
                command.env(k, v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()));
            }
        }

        debug!(execution = %request.execution_id, cmd, "spawning shell command");
        let output = command
            .output()
            .await
            .map_err(|e| RunnerError::Failed(format!("spawn failed: {e}")))?;

        let return_code = output.status.code().unwrap_or(-1);
        let succeeded = return_code == 0;
        let result = json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "return_code": return_code,
            "succeeded": succeeded,
            "failed": !succeeded,
        });
        Ok(RunOutcome::Complete {
            status: if succeeded {
                ExecutionStatus::Succeeded
            } else {
                ExecutionStatus::Failed
            },
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_request;
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let runner = LocalShellRunner;
        let outcome = runner
            .run(&test_request(json!({"cmd": "echo h1"})))
            .await
            .unwrap();
        let RunOutcome::Complete { status, result } = outcome else {
            panic!("shell runner is synchronous");
        };
        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(result["stdout"], "h1\n");
        assert_eq!(result["return_code"], 0);
        assert_eq!(result["succeeded"], true);
    }

    #[tokio::test]
    async fn nonzero_exit_fails() {
        let runner = LocalShellRunner;
        let outcome = runner
            .run(&test_request(json!({"cmd": "echo oops >&2; exit 3"})))
            .await
            .unwrap();
        let RunOutcome::Complete { status, result } = outcome else {
            panic!("shell runner is synchronous");
        };
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(result["return_code"], 3);
        assert_eq!(result["stderr"], "oops\n");
        assert_eq!(result["failed"], true);
    }

    #[tokio::test]
    async fn missing_cmd_is_invalid() {
        let runner = LocalShellRunner;
        let err = runner.run(&test_request(json!({}))).await.unwrap_err();
        assert!(matches!(err, RunnerError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn env_is_passed_through() {
        let runner = LocalShellRunner;
        let outcome = runner
            .run(&test_request(json!({"cmd": "echo $GREETING", "env": {"GREETING": "hi"}})))
            .await
            .unwrap();
        let RunOutcome::Complete { result, .. } = outcome else {
            panic!("shell runner is synchronous");
        };
        assert_eq!(result["stdout"], "hi\n");
    }
}
