//! Per-trigger rule cache with CUD invalidation.
//!
//! The engine consults this on every trigger instance; rule writes publish on
//! the rule exchange and the invalidator task clears the whole cache. Rules
//! change rarely, so full invalidation beats tracking per-ref deltas.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::{exchanges, MessageBus};
use crate::models::RuleRow;
use crate::store::{Store, StoreResult};

pub struct RuleCache {
    store: Arc<Store>,
    by_trigger: RwLock<HashMap<String, Arc<Vec<RuleRow>>>>,
}

impl RuleCache {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            by_trigger: RwLock::new(HashMap::new()),
        })
    }

    /// Enabled rules bound to `trigger_ref`, loaded through the cache.
    pub async fn rules_for(&self, trigger_ref: &str) -> StoreResult<Arc<Vec<RuleRow>>> {
        if let Some(hit) = self.by_trigger.read().await.get(trigger_ref) {
            return Ok(Arc::clone(hit));
        }
        let rules = Arc::new(self.store.list_enabled_rules_for_trigger(trigger_ref).await?);
        self.by_trigger
            .write()
            .await
            .insert(trigger_ref.to_string(), Arc::clone(&rules));
        Ok(rules)
    }

    pub async fn invalidate(&self) {
        self.by_trigger.write().await.clear();
    }

    /// Subscribe to rule create/update/delete and clear the cache on each.
    pub fn spawn_invalidator(self: &Arc<Self>, bus: Arc<MessageBus>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let sub = bus
                .declare_queue("rules-engine.rule-updates", &[(exchanges::RULE, "#")])
                .await;
            loop {
                let delivery = sub.recv().await;
                debug!(key = %delivery.message().routing_key, "rule changed, cache cleared");
                cache.invalidate().await;
                delivery.ack();
            }
        })
    }
}
