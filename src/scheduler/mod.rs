//! Execution scheduler: admits requested executions past the policy gate.
//!
//! Consumes `liveaction.status` with key `requested`, applies admission
//! policies and claims the transition with a guarded update, so replicas can
//! consume the same queue without double-scheduling. Delayed executions are
//! parked in the database and fed back through `requested` by the periodic
//! sweep and by completion nudges when an execution of the same action
//! finishes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::{exchanges, MessageBus};
use crate::config::SchedulerConfig;
use crate::models::{error_result, ErrorKind, ExecutionStatus, LiveActionRow};
use crate::policies::{PolicyDecision, PolicyEngine};
use crate::store::{Store, StoreError};

const SWEEP_BATCH: i64 = 100;

pub struct Scheduler {
    store: Arc<Store>,
    bus: Arc<MessageBus>,
    policies: Arc<PolicyEngine>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<MessageBus>,
        policies: Arc<PolicyEngine>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            policies,
            config,
        })
    }

    /// Consume the requested-executions queue with `pool_size` competing
    /// handlers.
    pub async fn run(self: Arc<Self>) {
        let sub = self
            .bus
            .declare_queue("scheduler", &[(exchanges::LIVEACTION_STATUS, "requested")])
            .await;
        let mut handles = Vec::new();
        for _ in 0..self.config.pool_size.max(1) {
            let scheduler = Arc::clone(&self);
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
                        warn!("requested-status message without an id, dropping");
                        delivery.ack();
                        continue;
                    };
                    match scheduler.schedule_one(&id).await {
                        Ok(()) => delivery.ack(),
                        Err(e @ (StoreError::Database(_) | StoreError::Timeout(_))) => {
                            warn!(liveaction = %id, "scheduling failed transiently: {e}");
                            delivery.nack();
                        }
                        Err(e) => {
                            warn!(liveaction = %id, "scheduling failed: {e}");
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

    /// Decide and claim one requested execution.
    pub async fn schedule_one(&self, liveaction_id: &str) -> Result<(), StoreError> {
        let live = self.store.get_live_action(liveaction_id).await?;
        match live.status_enum() {
            Some(ExecutionStatus::Requested) => {}
            // Redelivery after the claim landed, or a cancel won the race.
            other => {
                debug!(liveaction = %liveaction_id, status = ?other, "not requested, skipping");
                return Ok(());
            }
        }

        match self.policies.admission_decision(&live).await? {
            PolicyDecision::Proceed => {
                let Some(claimed) = self
                    .store
                    .claim_live_action(
                        liveaction_id,
                        &[ExecutionStatus::Requested],
                        ExecutionStatus::Scheduled,
                    )
                    .await?
                else {
                    debug!(liveaction = %liveaction_id, "lost the scheduling claim");
                    return Ok(());
                };
                debug!(liveaction = %liveaction_id, action = %claimed.action_ref, "scheduled");
                self.publish_status(&claimed, "scheduled").await;
            }
            PolicyDecision::Delay { policy_ref } => {
                let Some(claimed) = self
                    .store
                    .claim_live_action(
                        liveaction_id,
                        &[ExecutionStatus::Requested],
                        ExecutionStatus::Delayed,
                    )
                    .await?
                else {
                    return Ok(());
                };
                info!(liveaction = %liveaction_id, policy = %policy_ref, "delayed by policy");
                self.publish_status(&claimed, "delayed").await;
            }
            PolicyDecision::Cancel { policy_ref, reason } => {
                let result = error_result(ErrorKind::PolicyRejected, &reason);
                match self
                    .store
                    .update_live_action_status(
                        liveaction_id,
                        live.revision,
                        ExecutionStatus::Canceled,
                        Some(&result),
                        None,
                    )
                    .await
                {
                    Ok(claimed) => {
                        info!(liveaction = %liveaction_id, policy = %policy_ref, "canceled by policy");
                        self.publish_status(&claimed, "canceled").await;
                    }
                    Err(StoreError::WriteConflict(_)) => {
                        debug!(liveaction = %liveaction_id, "cancel lost a revision race");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Periodic sweep: move delayed executions back to `requested` so the
    /// policy gate re-examines them.
    pub async fn run_delayed_sweep(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.rescheduling_interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.requeue_delayed().await {
                warn!("delayed-execution sweep failed: {e}");
            }
        }
    }

    /// Nudge: when an execution completes, re-request delayed executions so a
    /// freed concurrency slot is filled without waiting for the next sweep.
    pub async fn run_completion_nudge(self: Arc<Self>) {
        let sub = self
            .bus
            .declare_queue(
                "scheduler.completions",
                &[
                    (exchanges::LIVEACTION_STATUS, "succeeded"),
                    (exchanges::LIVEACTION_STATUS, "failed"),
                    (exchanges::LIVEACTION_STATUS, "canceled"),
                ],
            )
            .await;
        loop {
            let delivery = sub.recv().await;
            if let Err(e) = self.requeue_delayed().await {
                warn!("completion nudge failed: {e}");
            }
            delivery.ack();
        }
    }

    pub async fn requeue_delayed(&self) -> Result<(), StoreError> {
        let delayed = self
            .store
            .list_live_actions_by_status(ExecutionStatus::Delayed, None, SWEEP_BATCH)
            .await?;
        for live in delayed {
            if let Some(claimed) = self
                .store
                .claim_live_action(
                    &live.id,
                    &[ExecutionStatus::Delayed],
                    ExecutionStatus::Requested,
                )
                .await?
            {
                debug!(liveaction = %claimed.id, "delayed execution re-requested");
                self.publish_status(&claimed, "requested").await;
            }
        }
        Ok(())
    }

    /// Startup recovery: executions claimed `scheduled` before a crash never
    /// reached a worker; push them back to `requested`.
    pub async fn recover_stuck_scheduled(&self) -> Result<(), StoreError> {
        let cutoff = (Utc::now()
            - chrono::Duration::seconds(self.config.delayed_execution_recovery_secs as i64))
        .to_rfc3339();
        let stuck = self
            .store
            .list_live_actions_by_status(ExecutionStatus::Scheduled, Some(&cutoff), SWEEP_BATCH)
            .await?;
        for live in stuck {
            if let Some(claimed) = self
                .store
                .claim_live_action(
                    &live.id,
                    &[ExecutionStatus::Scheduled],
                    ExecutionStatus::Requested,
                )
                .await?
            {
                info!(liveaction = %claimed.id, "recovered stuck scheduled execution");
                self.publish_status(&claimed, "requested").await;
            }
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup(config: SchedulerConfig) -> (TempDir, Arc<Store>, Arc<MessageBus>, Arc<Scheduler>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path()).await.unwrap());
        let bus = Arc::new(MessageBus::new("test"));
        let policies = PolicyEngine::new(Arc::clone(&store));
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            policies,
            config,
        );
        (dir, store, bus, scheduler)
    }

    async fn request_one(store: &Store) -> LiveActionRow {
        let action = store
            .register_action("core", "local", "local-shell-cmd", &json!({}), None)
            .await
            .unwrap();
        let (live, _) = store
            .create_live_action_pair(&action, &json!({"cmd": "true"}), &json!({}), None, None)
            .await
            .unwrap();
        live
    }

    #[tokio::test]
    async fn schedules_a_requested_execution() {
        let (_dir, store, bus, scheduler) = setup(SchedulerConfig::default()).await;
        let worker_queue = bus
            .declare_queue("worker", &[(exchanges::LIVEACTION_STATUS, "scheduled")])
            .await;
        let live = request_one(&store).await;

        scheduler.schedule_one(&live.id).await.unwrap();

        let updated = store.get_live_action(&live.id).await.unwrap();
        assert_eq!(updated.status, "scheduled");
        let delivery = worker_queue.try_recv().expect("scheduled status published");
        assert_eq!(delivery.message().body["id"], live.id.as_str());
        delivery.ack();
    }

    #[tokio::test]
    async fn concurrency_policy_delays_then_sweep_requeues() {
        let (_dir, store, bus, scheduler) = setup(SchedulerConfig::default()).await;
        let requested_queue = bus
            .declare_queue("requested-observer", &[(exchanges::LIVEACTION_STATUS, "requested")])
            .await;
        let first = request_one(&store).await;
        store
            .add_or_update_policy(
                "core",
                "local.cap",
                "core.local",
                crate::models::POLICY_TYPE_CONCURRENCY,
                &json!({"threshold": 1}),
            )
            .await
            .unwrap();

        scheduler.schedule_one(&first.id).await.unwrap();
        assert_eq!(store.get_live_action(&first.id).await.unwrap().status, "scheduled");

        let action = store.get_action_by_ref("core.local").await.unwrap();
        let (second, _) = store
            .create_live_action_pair(&action, &json!({}), &json!({}), None, None)
            .await
            .unwrap();
        scheduler.schedule_one(&second.id).await.unwrap();
        assert_eq!(store.get_live_action(&second.id).await.unwrap().status, "delayed");

        // First completes; the sweep re-requests the delayed one.
        let running = store
            .claim_live_action(&first.id, &[ExecutionStatus::Scheduled], ExecutionStatus::Running)
            .await
            .unwrap()
            .unwrap();
        store
            .update_live_action_status(
                &first.id,
                running.revision,
                ExecutionStatus::Succeeded,
                Some(&json!({"ok": true})),
                None,
            )
            .await
            .unwrap();
        scheduler.requeue_delayed().await.unwrap();
        assert_eq!(store.get_live_action(&second.id).await.unwrap().status, "requested");
        assert!(requested_queue.try_recv().is_some());
    }

    #[tokio::test]
    async fn cancel_policy_writes_policy_rejected_result() {
        let (_dir, store, _bus, scheduler) = setup(SchedulerConfig::default()).await;
        let live = request_one(&store).await;
        store
            .add_or_update_policy(
                "core",
                "local.cap",
                "core.local",
                crate::models::POLICY_TYPE_CONCURRENCY,
                &json!({"threshold": 0, "action": "cancel"}),
            )
            .await
            .unwrap();

        scheduler.schedule_one(&live.id).await.unwrap();

        let updated = store.get_live_action(&live.id).await.unwrap();
        assert_eq!(updated.status, "canceled");
        assert_eq!(updated.result_value()["error_kind"], "policy-rejected");
        assert!(updated.end_timestamp.is_some());
    }

    #[tokio::test]
    async fn recovery_requeues_old_scheduled_executions() {
        let config = SchedulerConfig {
            delayed_execution_recovery_secs: 0,
            ..SchedulerConfig::default()
        };
        let (_dir, store, _bus, scheduler) = setup(config).await;
        let live = request_one(&store).await;
        store
            .claim_live_action(&live.id, &[ExecutionStatus::Requested], ExecutionStatus::Scheduled)
            .await
            .unwrap();

        scheduler.recover_stuck_scheduled().await.unwrap();
        assert_eq!(store.get_live_action(&live.id).await.unwrap().status, "requested");
    }

    #[tokio::test]
    async fn skips_executions_that_are_no_longer_requested() {
        let (_dir, store, _bus, scheduler) = setup(SchedulerConfig::default()).await;
        let live = request_one(&store).await;
        store
            .claim_live_action(&live.id, &[ExecutionStatus::Requested], ExecutionStatus::Scheduled)
            .await
            .unwrap();

        // Redelivery of the requested message after the claim landed.
        scheduler.schedule_one(&live.id).await.unwrap();
        assert_eq!(store.get_live_action(&live.id).await.unwrap().status, "scheduled");
    }
}
