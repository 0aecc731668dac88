//! HTTP request runner.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::models::ExecutionStatus;

use super::{ActionRunner, RunOutcome, RunRequest, RunnerError, RUNNER_HTTP};

pub struct HttpRunner {
    client: reqwest::Client,
}

impl HttpRunner {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionRunner for HttpRunner {
    fn name(&self) -> &'static str {
        RUNNER_HTTP
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutcome, RunnerError> {
        let url = request
            .parameters
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| RunnerError::InvalidParameters("'url' is required".to_string()))?;
        let method = request
            .parameters
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");
        let method: reqwest::Method = method
            .to_uppercase()
            .parse()
            .map_err(|_| RunnerError::InvalidParameters(format!("invalid method '{method}'")))?;

        let mut req = self.client.request(method, url);
        if let Some(headers) = request.parameters.get("headers").and_then(Value::as_object) {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    req = req.header(k, v);
                }
            }
        }
        if let Some(body) = request.parameters.get("body") {
            if !body.is_null() {
                req = match body {
                    Value::String(s) => req.body(s.clone()),
                    other => req.json(other),
                };
            }
        }

        debug!(execution = %request.execution_id, url, "issuing http request");
        let response = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                // Transport failure is a failed execution, not a worker error.
                return Ok(RunOutcome::Complete {
                    status: ExecutionStatus::Failed,
                    result: json!({"error": e.to_string(), "succeeded": false, "failed": true}),
                });
            }
        };

        let status_code = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        let succeeded = status_code < 400;
        Ok(RunOutcome::Complete {
            status: if succeeded {
                ExecutionStatus::Succeeded
            } else {
                ExecutionStatus::Failed
            },
            result: json!({
                "status_code": status_code,
                "body": body,
                "succeeded": succeeded,
                "failed": !succeeded,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_request;
    use super::*;

    #[tokio::test]
    async fn missing_url_is_invalid() {
        let runner = HttpRunner::new();
        let err = runner.run(&test_request(json!({}))).await.unwrap_err();
        assert!(matches!(err, RunnerError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn unreachable_host_fails_the_execution() {
        let runner = HttpRunner::new();
        let outcome = runner
            .run(&test_request(json!({"url": "http://127.0.0.1:1/nope"})))
            .await
            .unwrap();
        let RunOutcome::Complete { status, result } = outcome else {
            panic!("http runner is synchronous");
        };
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(result["failed"], true);
    }

    #[tokio::test]
    async fn bogus_method_is_invalid() {
        let runner = HttpRunner::new();
        let err = runner
            .run(&test_request(json!({"url": "http://example.com", "method": "NOT A METHOD"})))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidParameters(_)));
    }
}
