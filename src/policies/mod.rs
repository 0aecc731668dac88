//! Admission-control policies applied before an execution is scheduled.
//!
//! Policies for an action are evaluated in alphabetical name order; the
//! first non-`Proceed` decision wins. `action.concurrency` gates on the
//! in-flight count (`scheduled`, `running`, `canceling`; the candidate is
//! excluded); `action.retry` is consulted by the worker after a failure.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::models::{LiveActionRow, PolicyRow, POLICY_TYPE_CONCURRENCY, POLICY_TYPE_RETRY};
use crate::store::{Store, StoreResult};

/// Verdict for one candidate execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Proceed,
    /// Park the execution as `delayed`; the scheduler re-examines it later.
    Delay { policy_ref: String },
    /// Cancel the execution outright.
    Cancel { policy_ref: String, reason: String },
}

/// Retry parameters from an `action.retry` policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySpec {
    pub policy_ref: String,
    pub max_retry_count: i64,
    pub delay_secs: u64,
}

pub struct PolicyEngine {
    store: Arc<Store>,
}

impl PolicyEngine {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Decide whether `live` may be scheduled now. Called by the scheduler
    /// for fresh and re-examined (delayed) executions alike.
    pub async fn admission_decision(&self, live: &LiveActionRow) -> StoreResult<PolicyDecision> {
        let policies = self
            .store
            .list_policies_for_resource(&live.action_ref)
            .await?;
        for policy in &policies {
            if policy.policy_type != POLICY_TYPE_CONCURRENCY {
                continue;
            }
            let decision = self.apply_concurrency(policy, live).await?;
            if decision != PolicyDecision::Proceed {
                return Ok(decision);
            }
        }
        Ok(PolicyDecision::Proceed)
    }

    async fn apply_concurrency(
        &self,
        policy: &PolicyRow,
        live: &LiveActionRow,
    ) -> StoreResult<PolicyDecision> {
        let params = policy.parameters_value();
        let threshold = params.get("threshold").and_then(Value::as_i64).unwrap_or(0);
        let on_over = params
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("delay");

        // Threshold 0 (or negative) admits nothing, ever.
        let over = if threshold <= 0 {
            true
        } else {
            let in_flight = self.store.count_in_flight(&live.action_ref, &live.id).await?;
            in_flight >= threshold
        };
        if !over {
            return Ok(PolicyDecision::Proceed);
        }
        debug!(
            policy = %policy.ref_,
            action = %live.action_ref,
            live_action = %live.id,
            threshold,
            on_over,
            "concurrency threshold reached"
        );
        Ok(if on_over == "cancel" {
            PolicyDecision::Cancel {
                policy_ref: policy.ref_.clone(),
                reason: format!(
                    "canceled by policy {}: concurrency threshold {threshold} reached",
                    policy.ref_
                ),
            }
        } else {
            PolicyDecision::Delay {
                policy_ref: policy.ref_.clone(),
            }
        })
    }

    /// Retry parameters for an action, if an `action.retry` policy exists.
    pub async fn retry_spec(&self, action_ref: &str) -> StoreResult<Option<RetrySpec>> {
        let policies = self.store.list_policies_for_resource(action_ref).await?;
        for policy in &policies {
            if policy.policy_type == POLICY_TYPE_RETRY {
                let params = policy.parameters_value();
                return Ok(Some(RetrySpec {
                    policy_ref: policy.ref_.clone(),
                    max_retry_count: params
                        .get("max_retry_count")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                    delay_secs: params.get("delay").and_then(Value::as_u64).unwrap_or(0),
                }));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionStatus;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<Store>, Arc<PolicyEngine>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path()).await.unwrap());
        let engine = PolicyEngine::new(Arc::clone(&store));
        (dir, store, engine)
    }

    async fn request_one(store: &Store, action_ref: &str) -> LiveActionRow {
        let action = store
            .register_action("core", action_ref.rsplit('.').next().unwrap(), "noop", &json!({}), None)
            .await
            .unwrap();
        let (live, _) = store
            .create_live_action_pair(&action, &json!({}), &json!({}), None, None)
            .await
            .unwrap();
        live
    }

    #[tokio::test]
    async fn no_policies_means_proceed() {
        let (_dir, store, engine) = setup().await;
        let live = request_one(&store, "core.local").await;
        assert_eq!(
            engine.admission_decision(&live).await.unwrap(),
            PolicyDecision::Proceed
        );
    }

    #[tokio::test]
    async fn threshold_zero_cancels_immediately() {
        let (_dir, store, engine) = setup().await;
        let live = request_one(&store, "core.local").await;
        store
            .add_or_update_policy(
                "core",
                "local.cap",
                &live.action_ref,
                POLICY_TYPE_CONCURRENCY,
                &json!({"threshold": 0, "action": "cancel"}),
            )
            .await
            .unwrap();
        assert!(matches!(
            engine.admission_decision(&live).await.unwrap(),
            PolicyDecision::Cancel { .. }
        ));
    }

    #[tokio::test]
    async fn threshold_delays_second_execution() {
        let (_dir, store, engine) = setup().await;
        let first = request_one(&store, "core.local").await;
        store
            .add_or_update_policy(
                "core",
                "local.cap",
                &first.action_ref,
                POLICY_TYPE_CONCURRENCY,
                &json!({"threshold": 1}),
            )
            .await
            .unwrap();

        // Nothing in flight yet: the first candidate proceeds.
        assert_eq!(
            engine.admission_decision(&first).await.unwrap(),
            PolicyDecision::Proceed
        );
        store
            .claim_live_action(&first.id, &[ExecutionStatus::Requested], ExecutionStatus::Scheduled)
            .await
            .unwrap();

        let action = store.get_action_by_ref(&first.action_ref).await.unwrap();
        let (second, _) = store
            .create_live_action_pair(&action, &json!({}), &json!({}), None, None)
            .await
            .unwrap();
        assert!(matches!(
            engine.admission_decision(&second).await.unwrap(),
            PolicyDecision::Delay { .. }
        ));
    }

    #[tokio::test]
    async fn disabled_policy_is_ignored() {
        let (_dir, store, engine) = setup().await;
        let live = request_one(&store, "core.local").await;
        store
            .add_or_update_policy(
                "core",
                "local.cap",
                &live.action_ref,
                POLICY_TYPE_CONCURRENCY,
                &json!({"threshold": 0, "action": "cancel"}),
            )
            .await
            .unwrap();
        store.disable_policy("core.local.cap").await.unwrap();
        assert_eq!(
            engine.admission_decision(&live).await.unwrap(),
            PolicyDecision::Proceed
        );
    }

    #[tokio::test]
    async fn retry_spec_lookup() {
        let (_dir, store, engine) = setup().await;
        let live = request_one(&store, "core.flaky").await;
        assert!(engine.retry_spec(&live.action_ref).await.unwrap().is_none());
        store
            .add_or_update_policy(
                "core",
                "flaky.retry",
                &live.action_ref,
                POLICY_TYPE_RETRY,
                &json!({"max_retry_count": 2, "delay": 1}),
            )
            .await
            .unwrap();
        let spec = engine.retry_spec(&live.action_ref).await.unwrap().unwrap();
        assert_eq!(spec.max_retry_count, 2);
        assert_eq!(spec.delay_secs, 1);
    }
}
