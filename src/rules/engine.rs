//! The rules engine: consumes dispatched trigger instances, matches rules and
//! requests action executions.
//!
//! Consumption is at-least-once; redeliveries are made safe by two guards:
//! the trigger instance status (`processed` instances are skipped wholesale)
//! and the `(trigger_instance, rule)` unique enforcement record (a matched
//! rule is never enforced twice).

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::bus::{exchanges, routing, MessageBus};
use crate::keyvalue::{KeyValueService, SYSTEM_SCOPE};
use crate::models::{
    RuleRow, TriggerInstanceRow, TriggerInstanceStatus, ENFORCEMENT_STATUS_FAILED,
    ENFORCEMENT_STATUS_SUCCEEDED,
};
use crate::store::{Store, StoreError, TraceComponent};
use crate::template::Renderer;

use super::cache::RuleCache;
use super::criteria::evaluate_criteria;

pub struct RulesEngine {
    store: Arc<Store>,
    bus: Arc<MessageBus>,
    cache: Arc<RuleCache>,
    kv: KeyValueService,
}

impl RulesEngine {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<MessageBus>,
        cache: Arc<RuleCache>,
        kv: KeyValueService,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            cache,
            kv,
        })
    }

    /// Consume the trigger-dispatch queue until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let sub = self
            .bus
            .declare_queue("rules-engine", &[(exchanges::TRIGGER_DISPATCH, "#")])
            .await;
        loop {
            let delivery = sub.recv().await;
            let Some(instance_id) = delivery
                .message()
                .body
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                warn!("trigger dispatch message without an id, dropping");
                delivery.ack();
                continue;
            };
            match self.process_instance(&instance_id).await {
                Ok(()) => delivery.ack(),
                // Transient store trouble: leave the instance pending and retry.
                Err(e @ (StoreError::Database(_) | StoreError::Timeout(_))) => {
                    warn!(instance_id, "processing failed transiently: {e}");
                    delivery.nack();
                }
                Err(e) => {
                    warn!(instance_id, "processing failed: {e}");
                    let _ = self
                        .store
                        .update_trigger_instance_status(
                            &instance_id,
                            TriggerInstanceStatus::ProcessingFailed,
                        )
                        .await;
                    delivery.ack();
                }
            }
        }
    }

    /// Match and enforce all rules for one trigger instance.
    pub async fn process_instance(&self, instance_id: &str) -> Result<(), StoreError> {
        let instance = self.store.get_trigger_instance(instance_id).await?;
        if instance.status_enum() == Some(TriggerInstanceStatus::Processed) {
            debug!(instance_id, "already processed, skipping redelivery");
            return Ok(());
        }
        self.store
            .update_trigger_instance_status(instance_id, TriggerInstanceStatus::Processing)
            .await?;

        let rules = self.cache.rules_for(&instance.trigger_ref).await?;
        let payload = instance.payload_value();
        let st2kv = self
            .kv
            .template_context(SYSTEM_SCOPE)
            .await
            .unwrap_or_else(|_| json!({}));
        let snapshot = self.kv.decrypted_snapshot(SYSTEM_SCOPE).await.unwrap_or_default();
        let renderer = Renderer::with_kv_snapshot(snapshot);
        let match_ctx = json!({ "trigger": payload, "st2kv": st2kv });

        let mut matched = 0usize;
        for rule in rules.iter() {
            match evaluate_criteria(&rule.criteria_value(), &match_ctx, &renderer) {
                Ok(true) => {
                    matched += 1;
                    self.enforce(rule, &instance, &match_ctx, &renderer).await?;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(rule = %rule.ref_, instance_id, "criteria evaluation failed: {e}");
                    self.record_enforcement(rule, &instance, None, Some(&e.to_string()))
                        .await;
                }
            }
        }
        debug!(
            instance_id,
            trigger_ref = %instance.trigger_ref,
            candidates = rules.len(),
            matched,
            "instance processed"
        );
        self.store
            .update_trigger_instance_status(instance_id, TriggerInstanceStatus::Processed)
            .await?;
        Ok(())
    }

    /// Render parameters, create the live action pair and the enforcement
    /// record, then announce the requested execution on the bus.
    async fn enforce(
        &self,
        rule: &RuleRow,
        instance: &TriggerInstanceRow,
        match_ctx: &Value,
        renderer: &Renderer,
    ) -> Result<(), StoreError> {
        // Enforcement dedup check first so redeliveries cannot double-fire.
        let enforced = self
            .store
            .list_enforcements_for_instance(&instance.id)
            .await?
            .iter()
            .any(|e| e.rule_id == rule.id);
        if enforced {
            debug!(rule = %rule.ref_, instance = %instance.id, "already enforced");
            return Ok(());
        }

        let mut render_ctx = match_ctx.clone();
        if let Some(obj) = render_ctx.as_object_mut() {
            obj.insert(
                "rule".to_string(),
                json!({"ref": rule.ref_, "pack": rule.pack, "name": rule.name}),
            );
            if let Value::Object(extra) = rule.context_value() {
                for (k, v) in extra {
                    obj.entry(k).or_insert(v);
                }
            }
        }

        let rendered = match renderer.render_value(&rule.action_parameters_value(), &render_ctx) {
            Ok(v) => v,
            Err(e) => {
                warn!(rule = %rule.ref_, instance = %instance.id, "parameter rendering failed: {e}");
                self.record_enforcement(rule, instance, None, Some(&e.to_string()))
                    .await;
                return Ok(());
            }
        };

        let action = match self.store.get_action_by_ref(&rule.action_ref).await {
            Ok(a) => a,
            Err(StoreError::NotFound(_)) => {
                let reason = format!("action {} is not registered", rule.action_ref);
                warn!(rule = %rule.ref_, instance = %instance.id, "{reason}");
                self.record_enforcement(rule, instance, None, Some(&reason)).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Action defaults under the rendered rule parameters.
        let mut parameters = action.parameters_value();
        if let (Value::Object(base), Value::Object(overlay)) = (&mut parameters, &rendered) {
            for (k, v) in overlay {
                base.insert(k.clone(), v.clone());
            }
        } else if rendered.is_object() {
            parameters = rendered;
        }

        let context = json!({
            "trigger_instance_id": instance.id,
            "rule_id": rule.id,
            "rule_ref": rule.ref_,
            "trace_tag": instance.trace_tag,
            "user": "system",
        });
        let (live, exec) = self
            .store
            .create_live_action_pair(
                &action,
                &parameters,
                &context,
                Some(&instance.id),
                Some(&rule.id),
            )
            .await?;

        self.record_enforcement(rule, instance, Some(&exec.id), None).await;
        if let Some(tag) = &instance.trace_tag {
            if let Ok(trace) = self.store.get_or_create_trace(tag).await {
                let _ = self
                    .store
                    .push_trace_component(&trace.id, TraceComponent::Rule, &rule.id, &rule.ref_)
                    .await;
                let _ = self
                    .store
                    .push_trace_component(
                        &trace.id,
                        TraceComponent::ActionExecution,
                        &exec.id,
                        &exec.action_ref,
                    )
                    .await;
            }
        }

        let body = serde_json::to_value(&live).unwrap_or_default();
        let _ = self
            .bus
            .publish(exchanges::LIVEACTION, routing::CREATE, body.clone())
            .await;
        let _ = self
            .bus
            .publish(exchanges::LIVEACTION_STATUS, "requested", body)
            .await;
        info!(
            rule = %rule.ref_,
            instance = %instance.id,
            execution = %exec.id,
            action = %action.ref_,
            "rule enforced"
        );
        Ok(())
    }

    async fn record_enforcement(
        &self,
        rule: &RuleRow,
        instance: &TriggerInstanceRow,
        execution_id: Option<&str>,
        failure_reason: Option<&str>,
    ) {
        let status = if failure_reason.is_some() {
            ENFORCEMENT_STATUS_FAILED
        } else {
            ENFORCEMENT_STATUS_SUCCEEDED
        };
        match self
            .store
            .create_rule_enforcement(
                &instance.id,
                &rule.id,
                &rule.ref_,
                execution_id,
                status,
                failure_reason,
            )
            .await
        {
            Ok(_) => {}
            Err(StoreError::Duplicate(_)) => {
                debug!(rule = %rule.ref_, instance = %instance.id, "enforcement raced a redelivery");
            }
            Err(e) => warn!(rule = %rule.ref_, "failed to record enforcement: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now_rfc3339;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<Store>, Arc<RulesEngine>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path()).await.unwrap());
        let bus = Arc::new(MessageBus::new("test"));
        let cache = RuleCache::new(Arc::clone(&store));
        let kv = KeyValueService::new(Arc::clone(&store), None);
        let engine = RulesEngine::new(Arc::clone(&store), bus, cache, kv);
        store
            .add_or_update_trigger_type("core", "st2.webhook", &json!({}), &json!({}))
            .await
            .unwrap();
        (dir, store, engine)
    }

    #[tokio::test]
    async fn broken_criteria_records_a_failed_enforcement() {
        let (_dir, store, engine) = setup().await;
        store
            .register_action("core", "local", "local-shell-cmd", &json!({}), None)
            .await
            .unwrap();
        let broken = store
            .add_or_update_rule(
                "examples",
                "broken",
                true,
                "core.st2.webhook",
                &json!({"trigger.host": {"type": "frobnicate", "pattern": "h1"}}),
                "core.local",
                &json!({}),
                &json!({}),
            )
            .await
            .unwrap();
        let good = store
            .add_or_update_rule(
                "examples",
                "good",
                true,
                "core.st2.webhook",
                &json!({"trigger.host": {"type": "equals", "pattern": "h1"}}),
                "core.local",
                &json!({}),
                &json!({}),
            )
            .await
            .unwrap();
        let instance = store
            .create_trigger_instance("core.st2.webhook", &json!({"host": "h1"}), &now_rfc3339(), None)
            .await
            .unwrap();

        engine.process_instance(&instance.id).await.unwrap();

        // The broken rule leaves a failed enforcement; the good one still fires.
        let row = store.get_trigger_instance(&instance.id).await.unwrap();
        assert_eq!(row.status, "processed");
        let enforcements = store.list_enforcements_for_instance(&instance.id).await.unwrap();
        assert_eq!(enforcements.len(), 2);

        let failed = enforcements.iter().find(|e| e.rule_id == broken.id).unwrap();
        assert_eq!(failed.status, ENFORCEMENT_STATUS_FAILED);
        assert!(failed.execution_id.is_none());
        assert!(failed
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("frobnicate"));

        let enforced = enforcements.iter().find(|e| e.rule_id == good.id).unwrap();
        assert_eq!(enforced.status, ENFORCEMENT_STATUS_SUCCEEDED);
        assert!(enforced.execution_id.is_some());
    }
}
