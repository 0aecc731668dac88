//! In-process topic-exchange message bus.
//!
//! Publishers emit on `(exchange, routing_key)`; queues bind to one or more
//! exchanges with AMQP-style patterns (`*` matches one dot-separated segment,
//! `#` matches any number). CUD exchanges route on `create|update|delete`;
//! status exchanges route on the literal status name.
//!
//! Delivery semantics are at-least-once: a [`Delivery`] that is nacked or
//! dropped without being acked is pushed back to the front of its queue with
//! `redelivered = true`. Consumers hold at most one delivery at a time
//! (prefetch 1), so slow work items do not starve peers of other queues.
//!
//! The database remains the only cross-replica coordination point; this bus
//! is the in-process notification fabric with the same wire contract a
//! broker-backed implementation would use.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

/// Exchange names, one per model family.
pub mod exchanges {
    pub const TRIGGER: &str = "trigger";
    pub const TRIGGER_DISPATCH: &str = "trigger_dispatch";
    pub const RULE: &str = "rule";
    pub const LIVEACTION: &str = "liveaction";
    pub const LIVEACTION_STATUS: &str = "liveaction.status";
    pub const WORKFLOW: &str = "workflow";
    pub const WORKFLOW_STATUS: &str = "workflow.status";
    pub const EXECUTION_STATE: &str = "actionexecutionstate";
    pub const ANNOUNCEMENT: &str = "announcement";
    pub const ACTION_ALIAS: &str = "actionalias";
}

/// Routing keys for CUD exchanges.
pub mod routing {
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
}

/// Default per-queue capacity before publishes start failing transiently.
const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Error)]
pub enum BusError {
    /// Transient condition: the caller is expected to retry with backoff.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// One message on the bus. Bodies are serialized model documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub body: Value,
    pub redelivered: bool,
}

struct QueueInner {
    name: String,
    capacity: usize,
    pending: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl QueueInner {
    fn push_back(&self, msg: Message) -> Result<(), BusError> {
        let mut pending = self.pending.lock().expect("queue mutex poisoned");
        if pending.len() >= self.capacity {
            return Err(BusError::Unavailable(format!(
                "queue {} is full ({} messages)",
                self.name, self.capacity
            )));
        }
        pending.push_back(msg);
        drop(pending);
        self.notify.notify_one();
        Ok(())
    }

    fn push_front(&self, msg: Message) {
        // Redeliveries bypass the capacity check: the message was already
        // admitted once and must not be lost.
        self.pending
            .lock()
            .expect("queue mutex poisoned")
            .push_front(msg);
        self.notify.notify_one();
    }
}

/// Consumer handle for one queue. Cloning creates a competing consumer.
#[derive(Clone)]
pub struct Subscription {
    queue: Arc<QueueInner>,
}

impl Subscription {
    /// Wait for the next message. The returned [`Delivery`] must be acked
    /// after its side effect is durably written; dropping it unacked requeues
    /// the message.
    pub async fn recv(&self) -> Delivery {
        loop {
            {
                let mut pending = self.queue.pending.lock().expect("queue mutex poisoned");
                if let Some(msg) = pending.pop_front() {
                    return Delivery {
                        message: Some(msg),
                        queue: Arc::clone(&self.queue),
                    };
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking variant used by shutdown paths and tests.
    pub fn try_recv(&self) -> Option<Delivery> {
        let msg = self
            .queue
            .pending
            .lock()
            .expect("queue mutex poisoned")
            .pop_front()?;
        Some(Delivery {
            message: Some(msg),
            queue: Arc::clone(&self.queue),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    pub fn depth(&self) -> usize {
        self.queue.pending.lock().expect("queue mutex poisoned").len()
    }
}

/// An in-flight message. Exactly one of `ack` / `nack` should be called;
/// dropping without either requeues the message (crash-safety default).
pub struct Delivery {
    message: Option<Message>,
    queue: Arc<QueueInner>,
}

impl Delivery {
    pub fn message(&self) -> &Message {
        self.message.as_ref().expect("delivery already settled")
    }

    /// Acknowledge: the side effect has been durably written.
    pub fn ack(mut self) {
        self.message = None;
    }

    /// Negative-acknowledge: push the message back for redelivery.
    pub fn nack(mut self) {
        if let Some(mut msg) = self.message.take() {
            msg.redelivered = true;
            self.queue.push_front(msg);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(mut msg) = self.message.take() {
            msg.redelivered = true;
            debug!(queue = %self.queue.name, key = %msg.routing_key, "unacked delivery requeued");
            self.queue.push_front(msg);
        }
    }
}

struct Binding {
    pattern: String,
    queue: Arc<QueueInner>,
}

#[derive(Default)]
struct BusState {
    /// exchange name → bindings.
    bindings: HashMap<String, Vec<Binding>>,
    /// queue name → queue (shared by competing consumers).
    queues: HashMap<String, Arc<QueueInner>>,
}

/// The topic bus. One instance per process, shared via `Arc`.
pub struct MessageBus {
    prefix: String,
    capacity: usize,
    state: RwLock<BusState>,
}

impl MessageBus {
    pub fn new(prefix: &str) -> Self {
        Self::with_capacity(prefix, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(prefix: &str, capacity: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            capacity,
            state: RwLock::new(BusState::default()),
        }
    }

    fn exchange_name(&self, exchange: &str) -> String {
        if self.prefix.is_empty() {
            exchange.to_string()
        } else {
            format!("{}.{}", self.prefix, exchange)
        }
    }

    /// Declare (or attach to) a durable queue bound to the given
    /// `(exchange, routing-key pattern)` pairs.
    pub async fn declare_queue(
        &self,
        name: &str,
        bindings: &[(&str, &str)],
    ) -> Subscription {
        let mut state = self.state.write().await;
        let queue = state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(QueueInner {
                    name: name.to_string(),
                    capacity: self.capacity,
                    pending: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            })
            .clone();

        for (exchange, pattern) in bindings {
            let full = self.exchange_name(exchange);
            let entries = state.bindings.entry(full).or_default();
            let already_bound = entries
                .iter()
                .any(|b| b.pattern == *pattern && Arc::ptr_eq(&b.queue, &queue));
            if !already_bound {
                entries.push(Binding {
                    pattern: pattern.to_string(),
                    queue: Arc::clone(&queue),
                });
            }
        }
        Subscription { queue }
    }

    /// Publish a message; it is copied into every queue whose binding
    /// pattern matches the routing key.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Value,
    ) -> Result<(), BusError> {
        let state = self.state.read().await;
        let full = self.exchange_name(exchange);
        let Some(bindings) = state.bindings.get(&full) else {
            debug!(exchange, routing_key, "publish on exchange with no bindings");
            return Ok(());
        };
        let mut result = Ok(());
        for binding in bindings {
            if topic_match(&binding.pattern, routing_key) {
                let msg = Message {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.clone(),
                    redelivered: false,
                };
                if let Err(e) = binding.queue.push_back(msg) {
                    warn!(exchange, routing_key, queue = %binding.queue.name, "publish failed: {e}");
                    result = Err(e);
                }
            }
        }
        result
    }
}

/// AMQP-style topic matching over dot-separated segments.
/// `*` matches exactly one segment; `#` matches zero or more.
pub fn topic_match(pattern: &str, key: &str) -> bool {
    fn rec(pat: &[&str], key: &[&str]) -> bool {
        match (pat.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                // '#' absorbs zero or more segments.
                rec(&pat[1..], key) || (!key.is_empty() && rec(pat, &key[1..]))
            }
            (Some(&"*"), Some(_)) => rec(&pat[1..], &key[1..]),
            (Some(&p), Some(&k)) if p == k => rec(&pat[1..], &key[1..]),
            _ => false,
        }
    }
    let pat: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    rec(&pat, &key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topic_matching() {
        assert!(topic_match("#", "a.b.c"));
        assert!(topic_match("a.*", "a.b"));
        assert!(!topic_match("a.*", "a.b.c"));
        assert!(topic_match("a.#", "a.b.c"));
        assert!(topic_match("a.#", "a"));
        assert!(topic_match("*.b.#", "a.b"));
        assert!(topic_match("succeeded", "succeeded"));
        assert!(!topic_match("succeeded", "failed"));
        assert!(!topic_match("a.b", "a"));
    }

    #[tokio::test]
    async fn publish_routes_to_matching_queues() {
        let bus = MessageBus::new("");
        let sub = bus
            .declare_queue("q1", &[("liveaction.status", "scheduled")])
            .await;
        let other = bus
            .declare_queue("q2", &[("liveaction.status", "succeeded")])
            .await;

        bus.publish("liveaction.status", "scheduled", json!({"id": "x"}))
            .await
            .unwrap();

        let delivery = sub.recv().await;
        assert_eq!(delivery.message().routing_key, "scheduled");
        assert!(!delivery.message().redelivered);
        delivery.ack();
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn nack_requeues_with_redelivered_flag() {
        let bus = MessageBus::new("");
        let sub = bus.declare_queue("q", &[("trigger_dispatch", "#")]).await;
        bus.publish("trigger_dispatch", "core.demo", json!({"n": 1}))
            .await
            .unwrap();

        let first = sub.recv().await;
        first.nack();

        let second = sub.recv().await;
        assert!(second.message().redelivered);
        second.ack();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_delivery_is_requeued() {
        let bus = MessageBus::new("");
        let sub = bus.declare_queue("q", &[("trigger_dispatch", "#")]).await;
        bus.publish("trigger_dispatch", "core.demo", json!({"n": 1}))
            .await
            .unwrap();

        {
            let delivery = sub.recv().await;
            let _ = delivery.message();
            // dropped without ack
        }
        let redelivered = sub.try_recv().expect("message requeued");
        assert!(redelivered.message().redelivered);
    }

    #[tokio::test]
    async fn prefix_scopes_exchanges() {
        let bus = MessageBus::new("test");
        let sub = bus.declare_queue("q", &[("trigger", "create")]).await;
        bus.publish("trigger", "create", json!({})).await.unwrap();
        assert!(sub.try_recv().is_some());
    }
}
