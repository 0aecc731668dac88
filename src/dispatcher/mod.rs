//! Trigger ingestion: persists instances and fans them out to the rules
//! engine.
//!
//! The instance row is the outbox: it is written `pending` before the
//! publish, so a crash or a full queue between write and publish loses
//! nothing — the pending sweep republishes instances that were never picked
//! up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{exchanges, MessageBus};
use crate::models::{new_trace_tag, now_rfc3339, TriggerInstanceRow};
use crate::store::{Store, StoreError, TraceComponent};

const SWEEP_INTERVAL_SECS: u64 = 10;
/// Pending instances younger than this are assumed to be in flight.
const PENDING_GRACE_SECS: i64 = 30;
const SWEEP_BATCH: i64 = 200;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid payload: {0}")]
    Validation(String),
}

pub struct TriggerDispatcher {
    store: Arc<Store>,
    bus: Arc<MessageBus>,
}

impl TriggerDispatcher {
    pub fn new(store: Arc<Store>, bus: Arc<MessageBus>) -> Arc<Self> {
        Arc::new(Self { store, bus })
    }

    /// Persist one trigger occurrence and announce it. The returned instance
    /// is `pending` until the rules engine picks it up.
    ///
    /// `occurrence_time` is an RFC 3339 timestamp for when the event actually
    /// happened; callers replaying historical events pass it, everyone else
    /// passes `None` and gets the current time.
    pub async fn dispatch(
        &self,
        trigger_ref: &str,
        payload: &Value,
        occurrence_time: Option<&str>,
        trace_tag: Option<&str>,
    ) -> Result<TriggerInstanceRow, DispatchError> {
        let trigger_type = self.store.get_trigger_type_by_ref(trigger_ref).await?;
        validate_payload(payload, &trigger_type.payload_schema_value())?;
        // Parameterless triggers share the ref of their type.
        let trigger = self
            .store
            .get_or_create_trigger(trigger_ref, &trigger_type.ref_, &Value::Null)
            .await?;

        let tag = trace_tag.map(str::to_string).unwrap_or_else(new_trace_tag);
        let occurred = occurrence_time.map(str::to_string).unwrap_or_else(now_rfc3339);
        let instance = self
            .store
            .create_trigger_instance(&trigger.ref_, payload, &occurred, Some(&tag))
            .await?;
        if let Ok(trace) = self.store.get_or_create_trace(&tag).await {
            let _ = self
                .store
                .push_trace_component(
                    &trace.id,
                    TraceComponent::TriggerInstance,
                    &instance.id,
                    &instance.trigger_ref,
                )
                .await;
        }

        self.publish_instance(&instance).await;
        info!(
            instance = %instance.id,
            trigger = %trigger_ref,
            trace = %tag,
            "trigger dispatched"
        );
        Ok(instance)
    }

    /// Publish failure is tolerated: the instance stays `pending` and the
    /// sweep retries it.
    async fn publish_instance(&self, instance: &TriggerInstanceRow) {
        let body = serde_json::to_value(instance).unwrap_or_default();
        if let Err(e) = self
            .bus
            .publish(exchanges::TRIGGER_DISPATCH, &instance.trigger_ref, body)
            .await
        {
            warn!(instance = %instance.id, "dispatch publish failed, left pending: {e}");
        }
    }

    /// Outbox sweep: republish pending instances older than the grace window.
    pub async fn run_pending_sweep(self: Arc<Self>) {
        let interval = Duration::from_secs(SWEEP_INTERVAL_SECS);
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.republish_pending().await {
                warn!("pending-instance sweep failed: {e}");
            }
        }
    }

    pub async fn republish_pending(&self) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(PENDING_GRACE_SECS)).to_rfc3339();
        let pending = self
            .store
            .list_pending_trigger_instances(&cutoff, SWEEP_BATCH)
            .await?;
        let count = pending.len();
        for instance in pending {
            debug!(instance = %instance.id, "republishing pending trigger instance");
            self.publish_instance(&instance).await;
        }
        Ok(count)
    }
}

/// Minimal structural validation against the trigger type's payload schema:
/// top-level type and required properties only.
fn validate_payload(payload: &Value, schema: &Value) -> Result<(), DispatchError> {
    if schema.is_null() || schema.as_object().map(|o| o.is_empty()).unwrap_or(false) {
        return Ok(());
    }
    if schema.get("type").and_then(Value::as_str) == Some("object") && !payload.is_object() {
        return Err(DispatchError::Validation(
            "payload must be an object".to_string(),
        ));
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if payload.get(field).is_none() {
                return Err(DispatchError::Validation(format!(
                    "payload is missing required field '{field}'"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<Store>, Arc<MessageBus>, Arc<TriggerDispatcher>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path()).await.unwrap());
        let bus = Arc::new(MessageBus::new("test"));
        let dispatcher = TriggerDispatcher::new(Arc::clone(&store), Arc::clone(&bus));
        store
            .add_or_update_trigger_type("core", "st2.webhook", &json!({}), &json!({"type": "object"}))
            .await
            .unwrap();
        (dir, store, bus, dispatcher)
    }

    #[tokio::test]
    async fn dispatch_persists_and_publishes() {
        let (_dir, store, bus, dispatcher) = setup().await;
        let sub = bus
            .declare_queue("rules-engine", &[(exchanges::TRIGGER_DISPATCH, "#")])
            .await;

        let instance = dispatcher
            .dispatch("core.st2.webhook", &json!({"body": {"host": "h1"}}), None, None)
            .await
            .unwrap();
        assert_eq!(instance.status, "pending");
        assert!(instance.trace_tag.is_some());

        let delivery = sub.recv().await;
        assert_eq!(delivery.message().routing_key, "core.st2.webhook");
        assert_eq!(delivery.message().body["id"], instance.id.as_str());
        delivery.ack();

        // The trace was opened with the instance as its first component.
        let traces = store
            .list_traces_by_tag(instance.trace_tag.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(traces.len(), 1);
        let components: Vec<Value> =
            serde_json::from_str(&traces[0].trigger_instances).unwrap();
        assert_eq!(components[0]["id"], instance.id.as_str());
    }

    #[tokio::test]
    async fn explicit_occurrence_time_is_persisted() {
        let (_dir, store, _bus, dispatcher) = setup().await;
        let when = "2026-01-05T08:30:00+00:00";
        let instance = dispatcher
            .dispatch("core.st2.webhook", &json!({"replayed": true}), Some(when), None)
            .await
            .unwrap();
        assert_eq!(instance.occurrence_time, when);
        let row = store.get_trigger_instance(&instance.id).await.unwrap();
        assert_eq!(row.occurrence_time, when);
    }

    #[tokio::test]
    async fn unknown_trigger_type_is_rejected() {
        let (_dir, _store, _bus, dispatcher) = setup().await;
        let err = dispatcher
            .dispatch("core.nope", &json!({}), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn payload_validation() {
        let (_dir, store, _bus, dispatcher) = setup().await;
        store
            .add_or_update_trigger_type(
                "core",
                "strict",
                &json!({}),
                &json!({"type": "object", "required": ["host"]}),
            )
            .await
            .unwrap();

        assert!(matches!(
            dispatcher.dispatch("core.strict", &json!({"cpu": 1}), None, None).await,
            Err(DispatchError::Validation(_))
        ));
        assert!(dispatcher
            .dispatch("core.strict", &json!({"host": "h1"}), None, None)
            .await
            .is_ok());
        // Non-object payload against an object schema.
        assert!(matches!(
            dispatcher.dispatch("core.st2.webhook", &json!(42), None, None).await,
            Err(DispatchError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn pending_sweep_republishes_old_instances() {
        let (_dir, store, bus, dispatcher) = setup().await;
        // Instance written directly with an old occurrence time, never
        // published (simulates a crash between write and publish).
        let old = (Utc::now() - chrono::Duration::seconds(120)).to_rfc3339();
        let instance = store
            .create_trigger_instance("core.st2.webhook", &json!({}), &old, None)
            .await
            .unwrap();

        let sub = bus
            .declare_queue("rules-engine", &[(exchanges::TRIGGER_DISPATCH, "#")])
            .await;
        let republished = dispatcher.republish_pending().await.unwrap();
        assert_eq!(republished, 1);
        let delivery = sub.try_recv().expect("instance republished");
        assert_eq!(delivery.message().body["id"], instance.id.as_str());
        delivery.ack();
    }

    #[tokio::test]
    async fn fresh_pending_instances_are_not_swept() {
        let (_dir, _store, bus, dispatcher) = setup().await;
        let sub = bus
            .declare_queue("rules-engine", &[(exchanges::TRIGGER_DISPATCH, "#")])
            .await;
        dispatcher
            .dispatch("core.st2.webhook", &json!({}), None, None)
            .await
            .unwrap();
        // Drain the immediate publish; the sweep must not duplicate it.
        sub.try_recv().expect("immediate publish").ack();
        assert_eq!(dispatcher.republish_pending().await.unwrap(), 0);
        assert!(sub.try_recv().is_none());
    }
}
