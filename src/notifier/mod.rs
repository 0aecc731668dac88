//! Notifier: turns terminal executions into notification and completion
//! triggers.
//!
//! Every terminal execution re-enters the pipeline as the generic action
//! trigger, so rules can chain off completions; executions whose action
//! carries a notify block additionally emit one notify trigger per route.
//! The delivery ledger (`notification_deliveries`, unique on
//! `(execution, route)`) makes each emission at-most-once across
//! redeliveries; failed emissions are retried up to `max_delivery_attempts`
//! within the claim, then recorded as failed.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::bus::{exchanges, MessageBus};
use crate::config::NotifierConfig;
use crate::dispatcher::TriggerDispatcher;
use crate::models::{ExecutionStatus, LiveActionRow};
use crate::store::{Store, StoreError};
use crate::template::Renderer;

/// Trigger emitted for every terminal execution.
pub const TRIGGER_GENERIC_ACTION: &str = "core.st2.generic.actiontrigger";
/// Trigger emitted per notify route.
pub const TRIGGER_NOTIFY: &str = "core.st2.generic.notifytrigger";

const DELIVERY_SENT: &str = "sent";
const DELIVERY_FAILED: &str = "failed";

pub struct Notifier {
    store: Arc<Store>,
    bus: Arc<MessageBus>,
    dispatcher: Arc<TriggerDispatcher>,
    config: NotifierConfig,
}

impl Notifier {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<MessageBus>,
        dispatcher: Arc<TriggerDispatcher>,
        config: NotifierConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            dispatcher,
            config,
        })
    }

    pub async fn run(self: Arc<Self>) {
        let sub = self
            .bus
            .declare_queue(
                "notifier",
                &[
                    (exchanges::LIVEACTION_STATUS, "succeeded"),
                    (exchanges::LIVEACTION_STATUS, "failed"),
                    (exchanges::LIVEACTION_STATUS, "canceled"),
                ],
            )
            .await;
        loop {
            let delivery = sub.recv().await;
            let Some(id) = delivery
                .message()
                .body
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                warn!("terminal-status message without an id, dropping");
                delivery.ack();
                continue;
            };
            match self.process(&id).await {
                Ok(()) => delivery.ack(),
                Err(e @ (StoreError::Database(_) | StoreError::Timeout(_))) => {
                    warn!(liveaction = %id, "notification failed transiently: {e}");
                    delivery.nack();
                }
                Err(e) => {
                    warn!(liveaction = %id, "notification failed: {e}");
                    delivery.ack();
                }
            }
        }
    }

    pub async fn process(&self, liveaction_id: &str) -> Result<(), StoreError> {
        let live = self.store.get_live_action(liveaction_id).await?;
        let Some(status) = live.status_enum().filter(ExecutionStatus::is_terminal) else {
            debug!(liveaction = %liveaction_id, status = %live.status, "not terminal, skipping");
            return Ok(());
        };
        let execution = self.store.get_execution_for_liveaction(&live.id).await?;

        // Announcement for watchers, claimed in the ledger like any other
        // route so a bus redelivery cannot announce the execution twice.
        match self
            .store
            .record_notification_delivery(&execution.id, "announcement", "pending")
            .await
        {
            Ok(_) => {
                let _ = self
                    .bus
                    .publish(
                        exchanges::ANNOUNCEMENT,
                        "execution",
                        serde_json::to_value(&execution).unwrap_or_default(),
                    )
                    .await;
                self.store
                    .update_notification_delivery(&execution.id, "announcement", DELIVERY_SENT, 1)
                    .await?;
            }
            Err(StoreError::Duplicate(_)) => {
                debug!(execution = %execution.id, "execution already announced");
            }
            Err(e) => return Err(e),
        }

        // Completion trigger for rule chaining, deduped per execution.
        let completion_payload = json!({
            "execution_id": execution.id,
            "action_ref": live.action_ref,
            "status": status.as_str(),
            "parameters": live.parameters_value(),
            "result": live.result_value(),
            "start_timestamp": live.start_timestamp,
            "end_timestamp": live.end_timestamp,
        });
        self.emit(&execution.id, "completion", TRIGGER_GENERIC_ACTION, &completion_payload, &live)
            .await?;

        let Some(notify) = live.notify_value() else {
            return Ok(());
        };
        let renderer = Renderer::new();
        for section in applicable_sections(status) {
            let Some(spec) = notify.get(section).filter(|s| !s.is_null()) else {
                continue;
            };
            let routes: Vec<String> = spec
                .get("routes")
                .and_then(Value::as_array)
                .map(|r| r.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            let message = self.render_message(&renderer, spec, &live, status);
            for route in routes {
                let payload = json!({
                    "execution_id": execution.id,
                    "status": status.as_str(),
                    "route": route,
                    "channel": route,
                    "message": message,
                    "data": live.result_value(),
                });
                self.emit(
                    &execution.id,
                    &format!("{section}:{route}"),
                    TRIGGER_NOTIFY,
                    &payload,
                    &live,
                )
                .await?;
            }
        }
        Ok(())
    }

    fn render_message(
        &self,
        renderer: &Renderer,
        spec: &Value,
        live: &LiveActionRow,
        status: ExecutionStatus,
    ) -> String {
        let fallback = format!("Action {} completed. status: {status}", live.action_ref);
        let Some(template) = spec.get("message").and_then(Value::as_str) else {
            return fallback;
        };
        let ctx = json!({
            "action_ref": live.action_ref,
            "status": status.as_str(),
            "result": live.result_value(),
            "parameters": live.parameters_value(),
        });
        match renderer.render(template, &ctx) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(action = %live.action_ref, "notify message render failed: {e}");
                fallback
            }
        }
    }

    /// Claim `(execution, route)` in the ledger, then dispatch with bounded
    /// retries. A `Duplicate` claim means the route was already handled.
    async fn emit(
        &self,
        execution_id: &str,
        route: &str,
        trigger_ref: &str,
        payload: &Value,
        live: &LiveActionRow,
    ) -> Result<(), StoreError> {
        match self
            .store
            .record_notification_delivery(execution_id, route, "pending")
            .await
        {
            Ok(_) => {}
            Err(StoreError::Duplicate(_)) => {
                debug!(execution = %execution_id, route, "route already delivered");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let trace_tag = live
            .context_value()
            .get("trace_tag")
            .and_then(Value::as_str)
            .map(str::to_string);
        let max_attempts = self.config.max_delivery_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self
                .dispatcher
                .dispatch(trigger_ref, payload, None, trace_tag.as_deref())
                .await
            {
                Ok(_) => {
                    self.store
                        .update_notification_delivery(
                            execution_id,
                            route,
                            DELIVERY_SENT,
                            attempt as i64,
                        )
                        .await?;
                    info!(execution = %execution_id, route, trigger = trigger_ref, "notification emitted");
                    return Ok(());
                }
                Err(e) if attempt < max_attempts => {
                    debug!(execution = %execution_id, route, attempt, "emission failed, retrying: {e}");
                }
                Err(e) => {
                    warn!(
                        execution = %execution_id,
                        route,
                        attempts = max_attempts,
                        "notification dropped after retries: {e}"
                    );
                    self.store
                        .update_notification_delivery(
                            execution_id,
                            route,
                            DELIVERY_FAILED,
                            max_attempts as i64,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }
}

fn applicable_sections(status: ExecutionStatus) -> Vec<&'static str> {
    match status {
        ExecutionStatus::Succeeded => vec!["on_complete", "on_success"],
        ExecutionStatus::Failed => vec!["on_complete", "on_failure"],
        _ => vec!["on_complete"],
    }
}
