//! Action worker: runs scheduled executions through their runners.
//!
//! Each handler claims `scheduled → running` with the revision protocol, so
//! a redelivered or doubly-routed message can never start the same runner
//! twice. The run future is raced against the execution timeout and the
//! cancellation signal; losing either race drops the future (which kills
//! spawned processes) and writes the corresponding terminal state.

pub mod cancel;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::bus::{exchanges, routing, MessageBus};
use crate::config::ActionRunnerConfig;
use crate::models::{error_result, ErrorKind, ExecutionStatus, LiveActionRow};
use crate::policies::PolicyEngine;
use crate::runners::{RunOutcome, RunRequest, RunnerError, RunnerRegistry};
use crate::store::{Store, StoreError};

pub use cancel::{CancelRegistry, CancelService};

pub struct ActionWorker {
    store: Arc<Store>,
    bus: Arc<MessageBus>,
    runners: Arc<RunnerRegistry>,
    policies: Arc<PolicyEngine>,
    cancels: Arc<CancelRegistry>,
    config: ActionRunnerConfig,
}

impl ActionWorker {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<MessageBus>,
        runners: Arc<RunnerRegistry>,
        policies: Arc<PolicyEngine>,
        cancels: Arc<CancelRegistry>,
        config: ActionRunnerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            runners,
            policies,
            cancels,
            config,
        })
    }

    /// Consume the scheduled-executions queue with `pool_size` competing
    /// handlers.
    pub async fn run(self: Arc<Self>) {
        let sub = self
            .bus
            .declare_queue("actionrunner", &[(exchanges::LIVEACTION_STATUS, "scheduled")])
            .await;
        let mut handles = Vec::new();
        for _ in 0..self.config.pool_size.max(1) {
            let worker = Arc::clone(&self);
            let sub = sub.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let delivery = sub.recv().await;
                    let Some(id) = delivery
                        .message()
                        .body
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                    else {
                        warn!("scheduled-status message without an id, dropping");
                        delivery.ack();
                        continue;
                    };
                    match worker.execute_one(&id).await {
                        Ok(()) => delivery.ack(),
                        Err(e @ (StoreError::Database(_) | StoreError::Timeout(_))) => {
                            warn!(liveaction = %id, "execution failed transiently: {e}");
                            delivery.nack();
                        }
                        Err(e) => {
                            warn!(liveaction = %id, "execution failed: {e}");
                            delivery.ack();
                        }
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Claim and run one scheduled execution end to end.
    pub async fn execute_one(&self, liveaction_id: &str) -> Result<(), StoreError> {
        let live = self.store.get_live_action(liveaction_id).await?;
        if live.status_enum() != Some(ExecutionStatus::Scheduled) {
            debug!(liveaction = %liveaction_id, status = %live.status, "not scheduled, skipping");
            return Ok(());
        }
        let live = match self
            .store
            .update_live_action_status(
                liveaction_id,
                live.revision,
                ExecutionStatus::Running,
                None,
                None,
            )
            .await
        {
            Ok(live) => live,
            Err(StoreError::WriteConflict(_)) => {
                debug!(liveaction = %liveaction_id, "lost the running claim");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.publish_status(&live, "running").await;

        let execution = self.store.get_execution_for_liveaction(&live.id).await?;
        let request = RunRequest {
            liveaction_id: live.id.clone(),
            execution_id: execution.id.clone(),
            action_ref: live.action_ref.clone(),
            parameters: live.parameters_value(),
            context: live.context_value(),
        };

        let Some(runner) = self.runners.get(&live.runner_type) else {
            let msg = format!("runner type '{}' is not registered", live.runner_type);
            warn!(liveaction = %live.id, "{msg}");
            self.finalize(
                &live.id,
                ExecutionStatus::Failed,
                error_result(ErrorKind::RunnerError, &msg),
            )
            .await?;
            return Ok(());
        };

        let timeout_secs = request
            .parameters
            .get("timeout")
            .and_then(Value::as_u64)
            .filter(|t| *t > 0)
            .unwrap_or(self.config.default_timeout_secs);
        let mut cancel_rx = self.cancels.register(&live.id);
        info!(
            liveaction = %live.id,
            execution = %execution.id,
            action = %live.action_ref,
            runner = %live.runner_type,
            timeout_secs,
            "running action"
        );

        let run = runner.run(&request);
        tokio::pin!(run);
        let verdict = tokio::select! {
            outcome = &mut run => Verdict::Finished(outcome),
            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => Verdict::TimedOut,
            _ = cancel_rx.changed() => Verdict::Canceled,
        };
        self.cancels.unregister(&live.id);

        match verdict {
            Verdict::Finished(Ok(RunOutcome::Complete { status, result })) => {
                self.finalize(&live.id, status, result).await?;
                self.maybe_retry(&live, status).await;
            }
            Verdict::Finished(Ok(RunOutcome::Pending {
                partial,
                query_module,
                query_context,
            })) => {
                let state = self
                    .store
                    .create_execution_state(&execution.id, &query_module, &query_context)
                    .await?;
                self.store
                    .update_live_action_runner_info(&live.id, &partial)
                    .await?;
                let _ = self
                    .bus
                    .publish(
                        exchanges::EXECUTION_STATE,
                        routing::CREATE,
                        serde_json::to_value(&state).unwrap_or_default(),
                    )
                    .await;
                debug!(execution = %execution.id, query_module, "execution handed to tracker");
            }
            Verdict::Finished(Err(RunnerError::InvalidParameters(msg))) => {
                self.finalize(
                    &live.id,
                    ExecutionStatus::Failed,
                    error_result(ErrorKind::ValidationError, &msg),
                )
                .await?;
            }
            Verdict::Finished(Err(RunnerError::Failed(msg))) => {
                self.finalize(
                    &live.id,
                    ExecutionStatus::Failed,
                    error_result(ErrorKind::RunnerError, &msg),
                )
                .await?;
                self.maybe_retry(&live, ExecutionStatus::Failed).await;
            }
            Verdict::TimedOut => {
                let msg = format!("action timed out after {timeout_secs}s");
                warn!(liveaction = %live.id, "{msg}");
                self.finalize(
                    &live.id,
                    ExecutionStatus::Failed,
                    error_result(ErrorKind::RunnerTimeout, &msg),
                )
                .await?;
                self.maybe_retry(&live, ExecutionStatus::Failed).await;
            }
            Verdict::Canceled => {
                // The cancel service already moved the row to `canceling`.
                runner.cancel(&request).await;
                if let Some(claimed) = self
                    .store
                    .claim_live_action(
                        &live.id,
                        &[ExecutionStatus::Canceling],
                        ExecutionStatus::Canceled,
                    )
                    .await?
                {
                    info!(liveaction = %live.id, "execution canceled while running");
                    self.publish_status(&claimed, "canceled").await;
                }
            }
        }
        Ok(())
    }

    /// Write a terminal status and announce it.
    async fn finalize(
        &self,
        liveaction_id: &str,
        status: ExecutionStatus,
        result: Value,
    ) -> Result<(), StoreError> {
        let live = self.store.get_live_action(liveaction_id).await?;
        match self
            .store
            .update_live_action_status(liveaction_id, live.revision, status, Some(&result), None)
            .await
        {
            Ok(updated) => {
                info!(liveaction = %liveaction_id, status = %status, "execution finished");
                self.publish_status(&updated, status.as_str()).await;
                Ok(())
            }
            Err(StoreError::WriteConflict(_)) => {
                // A cancel raced the completion; the other writer wins.
                debug!(liveaction = %liveaction_id, "finalize lost a revision race");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Consult the action's retry policy after a failure and re-request a
    /// fresh execution when attempts remain.
    async fn maybe_retry(&self, live: &LiveActionRow, status: ExecutionStatus) {
        if status != ExecutionStatus::Failed {
            return;
        }
        let spec = match self.policies.retry_spec(&live.action_ref).await {
            Ok(Some(spec)) => spec,
            Ok(None) => return,
            Err(e) => {
                warn!(action = %live.action_ref, "retry policy lookup failed: {e}");
                return;
            }
        };
        let context = live.context_value();
        let retry_no = context.get("retry_no").and_then(Value::as_i64).unwrap_or(0);
        if retry_no >= spec.max_retry_count {
            debug!(liveaction = %live.id, retry_no, "retry budget exhausted");
            return;
        }

        let action = match self.store.get_action_by_ref(&live.action_ref).await {
            Ok(a) => a,
            Err(e) => {
                warn!(action = %live.action_ref, "retry skipped, action lookup failed: {e}");
                return;
            }
        };
        let mut retry_context = context;
        if let Some(obj) = retry_context.as_object_mut() {
            obj.insert("retry_no".to_string(), json!(retry_no + 1));
            obj.insert("retried_from".to_string(), json!(live.id));
        }
        let store = Arc::clone(&self.store);
        let bus = Arc::clone(&self.bus);
        let parameters = live.parameters_value();
        let policy_ref = spec.policy_ref.clone();
        let delay = Duration::from_secs(spec.delay_secs);
        let failed_id = live.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match store
                .create_live_action_pair(&action, &parameters, &retry_context, None, None)
                .await
            {
                Ok((retry, _)) => {
                    info!(
                        failed = %failed_id,
                        retry = %retry.id,
                        policy = %policy_ref,
                        attempt = retry_no + 1,
                        "retrying failed execution"
                    );
                    let body = serde_json::to_value(&retry).unwrap_or_default();
                    let _ = bus.publish(exchanges::LIVEACTION, routing::CREATE, body.clone()).await;
                    let _ = bus.publish(exchanges::LIVEACTION_STATUS, "requested", body).await;
                }
                Err(e) => warn!(failed = %failed_id, "retry creation failed: {e}"),
            }
        });
    }

    async fn publish_status(&self, live: &LiveActionRow, status: &str) {
        let body = serde_json::to_value(live).unwrap_or_default();
        if let Err(e) = self
            .bus
            .publish(exchanges::LIVEACTION_STATUS, status, body)
            .await
        {
            warn!(liveaction = %live.id, status, "status publish failed: {e}");
        }
    }
}

enum Verdict {
    Finished(Result<RunOutcome, RunnerError>),
    TimedOut,
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActionRow;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        store: Arc<Store>,
        bus: Arc<MessageBus>,
        worker: Arc<ActionWorker>,
        cancels: Arc<CancelRegistry>,
    }

    async fn setup(config: ActionRunnerConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path()).await.unwrap());
        let bus = Arc::new(MessageBus::new("test"));
        let cancels = CancelRegistry::new();
        let worker = ActionWorker::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::new(RunnerRegistry::builtin()),
            PolicyEngine::new(Arc::clone(&store)),
            Arc::clone(&cancels),
            config,
        );
        Harness {
            _dir: dir,
            store,
            bus,
            worker,
            cancels,
        }
    }

    async fn register_shell_action(store: &Store) -> ActionRow {
        store
            .register_action("core", "local", "local-shell-cmd", &json!({}), None)
            .await
            .unwrap()
    }

    async fn scheduled_live_action(store: &Store, action: &ActionRow, params: Value) -> LiveActionRow {
        let (live, _) = store
            .create_live_action_pair(action, &params, &json!({}), None, None)
            .await
            .unwrap();
        store
            .claim_live_action(&live.id, &[ExecutionStatus::Requested], ExecutionStatus::Scheduled)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn runs_a_shell_command_to_success() {
        let h = setup(ActionRunnerConfig::default()).await;
        let action = register_shell_action(&h.store).await;
        let live = scheduled_live_action(&h.store, &action, json!({"cmd": "echo h1"})).await;

        h.worker.execute_one(&live.id).await.unwrap();

        let done = h.store.get_live_action(&live.id).await.unwrap();
        assert_eq!(done.status, "succeeded");
        let result = done.result_value();
        assert_eq!(result["stdout"], "h1\n");
        assert_eq!(result["return_code"], 0);
        assert!(done.start_timestamp.is_some());
        assert!(done.end_timestamp.is_some());

        // Mirror carries the same terminal state.
        let exec = h.store.get_execution_for_liveaction(&live.id).await.unwrap();
        assert_eq!(exec.status, "succeeded");
        assert_eq!(exec.result_value()["stdout"], "h1\n");
    }

    #[tokio::test]
    async fn timeout_fails_with_runner_timeout() {
        let config = ActionRunnerConfig {
            default_timeout_secs: 1,
            ..ActionRunnerConfig::default()
        };
        let h = setup(config).await;
        let action = register_shell_action(&h.store).await;
        let live = scheduled_live_action(&h.store, &action, json!({"cmd": "sleep 30"})).await;

        h.worker.execute_one(&live.id).await.unwrap();

        let done = h.store.get_live_action(&live.id).await.unwrap();
        assert_eq!(done.status, "failed");
        assert_eq!(done.result_value()["error_kind"], "runner-timeout");
    }

    #[tokio::test]
    async fn unknown_runner_type_fails() {
        let h = setup(ActionRunnerConfig::default()).await;
        let action = h
            .store
            .register_action("core", "weird", "no-such-runner", &json!({}), None)
            .await
            .unwrap();
        let live = scheduled_live_action(&h.store, &action, json!({})).await;

        h.worker.execute_one(&live.id).await.unwrap();
        let done = h.store.get_live_action(&live.id).await.unwrap();
        assert_eq!(done.status, "failed");
        assert_eq!(done.result_value()["error_kind"], "runner-error");
    }

    #[tokio::test]
    async fn async_runner_leaves_execution_running_with_state() {
        let h = setup(ActionRunnerConfig::default()).await;
        let action = h
            .store
            .register_action("core", "slow", "mock-async", &json!({}), None)
            .await
            .unwrap();
        let live =
            scheduled_live_action(&h.store, &action, json!({"external_id": "x1"})).await;

        h.worker.execute_one(&live.id).await.unwrap();

        let running = h.store.get_live_action(&live.id).await.unwrap();
        assert_eq!(running.status, "running");
        let states = h.store.list_states_for_running_executions().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].query_module, "mock-async");
        assert_eq!(states[0].query_context_value()["external_id"], "x1");
    }

    #[tokio::test]
    async fn redelivered_scheduled_message_is_a_noop() {
        let h = setup(ActionRunnerConfig::default()).await;
        let action = register_shell_action(&h.store).await;
        let live = scheduled_live_action(&h.store, &action, json!({"cmd": "echo once"})).await;

        h.worker.execute_one(&live.id).await.unwrap();
        // Second delivery of the same scheduled message.
        h.worker.execute_one(&live.id).await.unwrap();

        let done = h.store.get_live_action(&live.id).await.unwrap();
        assert_eq!(done.status, "succeeded");
    }

    #[tokio::test]
    async fn cancel_while_running_never_writes_success() {
        let h = setup(ActionRunnerConfig::default()).await;
        let action = register_shell_action(&h.store).await;
        let live = scheduled_live_action(&h.store, &action, json!({"cmd": "sleep 30"})).await;

        let cancel_service = CancelService::new(
            Arc::clone(&h.store),
            Arc::clone(&h.bus),
            Arc::clone(&h.cancels),
        );
        let worker = Arc::clone(&h.worker);
        let id = live.id.clone();
        let run = tokio::spawn(async move { worker.execute_one(&id).await });

        // Wait for the worker to reach `running`, then cancel.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if h.store.get_live_action(&live.id).await.unwrap().status == "running" {
                break;
            }
        }
        cancel_service.cancel(&live.id).await.unwrap();
        run.await.unwrap().unwrap();

        let done = h.store.get_live_action(&live.id).await.unwrap();
        assert_eq!(done.status, "canceled");
        assert!(done.end_timestamp.is_some());
    }
}
