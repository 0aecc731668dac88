//! Runner abstraction and the built-in runner set.
//!
//! A runner turns rendered parameters into a result document. Synchronous
//! runners complete inline; asynchronous ones return
//! [`RunOutcome::Pending`] with a query context handed to the results
//! tracker. Cancellation is cooperative: the worker drops the in-flight run
//! future and calls [`ActionRunner::cancel`] for best-effort external cleanup.

pub mod http;
pub mod local;
pub mod mock;
pub mod noop;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::ExecutionStatus;

pub const RUNNER_LOCAL_SHELL: &str = "local-shell-cmd";
pub const RUNNER_HTTP: &str = "http-request";
pub const RUNNER_NOOP: &str = "noop";
pub const RUNNER_MOCK_ASYNC: &str = "mock-async";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("runner failed: {0}")]
    Failed(String),
}

/// Everything a runner gets to see about one invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub liveaction_id: String,
    pub execution_id: String,
    pub action_ref: String,
    pub parameters: Value,
    pub context: Value,
}

/// What a run produced.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The action finished; `status` is `Succeeded` or `Failed`.
    Complete {
        status: ExecutionStatus,
        result: Value,
    },
    /// The action continues in an external system. The tracker polls
    /// `query_module` with `query_context` until a terminal result arrives.
    Pending {
        partial: Value,
        query_module: String,
        query_context: Value,
    },
}

#[async_trait]
pub trait ActionRunner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, request: &RunRequest) -> Result<RunOutcome, RunnerError>;

    /// Best-effort external cleanup after a cancel request. Must not block
    /// the cancellation path; the default does nothing.
    async fn cancel(&self, _request: &RunRequest) {}
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Name → runner table. Built once at startup and shared by the worker pool.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: HashMap<&'static str, Arc<dyn ActionRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in runners.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(local::LocalShellRunner));
        registry.register(Arc::new(http::HttpRunner::new()));
        registry.register(Arc::new(noop::NoopRunner));
        registry.register(Arc::new(mock::MockAsyncRunner));
        registry
    }

    pub fn register(&mut self, runner: Arc<dyn ActionRunner>) {
        self.runners.insert(runner.name(), runner);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionRunner>> {
        self.runners.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.runners.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
pub(crate) fn test_request(parameters: Value) -> RunRequest {
    RunRequest {
        liveaction_id: "la-test".to_string(),
        execution_id: "ex-test".to_string(),
        action_ref: "test.action".to_string(),
        parameters,
        context: Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_contents() {
        let registry = RunnerRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec![RUNNER_HTTP, RUNNER_LOCAL_SHELL, RUNNER_MOCK_ASYNC, RUNNER_NOOP]
        );
        assert!(registry.get(RUNNER_LOCAL_SHELL).is_some());
        assert!(registry.get("no-such-runner").is_none());
    }
}
