//! Garbage collector: periodic purge of aged rows.
//!
//! Phases run in a fixed order with a pause between them so a large purge
//! does not monopolize the write path. Each TTL-driven phase is disabled
//! when its TTL is 0; expired tokens and key-value pairs are always purged.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::config::GarbageCollectorConfig;
use crate::store::{Store, StoreError};

pub struct GarbageCollector {
    store: Arc<Store>,
    config: GarbageCollectorConfig,
}

impl GarbageCollector {
    pub fn new(store: Arc<Store>, config: GarbageCollectorConfig) -> Arc<Self> {
        Arc::new(Self { store, config })
    }

    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.collection_interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.collect().await {
                warn!("garbage collection pass failed: {e}");
            }
        }
    }

    /// One full collection pass. Phase order matters: instances go first so
    /// execution purges never resurrect work through the pending sweep.
    pub async fn collect(&self) -> Result<(), StoreError> {
        let pause = Duration::from_secs(self.config.sleep_delay_secs);

        if let Some(cutoff) = cutoff_for(self.config.ttl_trigger_instances_days) {
            let purged = self.store.delete_trigger_instances_older_than(&cutoff).await?;
            log_phase("trigger-instances", purged);
            tokio::time::sleep(pause).await;
        }
        if let Some(cutoff) = cutoff_for(self.config.ttl_executions_days) {
            let purged = self.store.delete_terminal_executions_older_than(&cutoff).await?;
            log_phase("executions", purged);
            tokio::time::sleep(pause).await;
        }

        let now = Utc::now().to_rfc3339();
        log_phase("tokens", self.store.delete_expired_tokens(&now).await?);
        tokio::time::sleep(pause).await;

        if let Some(cutoff) = cutoff_for(self.config.ttl_traces_days) {
            let purged = self.store.delete_traces_older_than(&cutoff).await?;
            log_phase("traces", purged);
            tokio::time::sleep(pause).await;
        }
        if let Some(cutoff) = cutoff_for(self.config.ttl_enforcements_days) {
            let purged = self.store.delete_enforcements_older_than(&cutoff).await?;
            log_phase("enforcements", purged);
            tokio::time::sleep(pause).await;
        }

        log_phase("key-value", self.store.delete_expired_kv(&now).await?);
        Ok(())
    }
}

fn cutoff_for(ttl_days: u32) -> Option<String> {
    if ttl_days == 0 {
        return None;
    }
    Some((Utc::now() - ChronoDuration::days(i64::from(ttl_days))).to_rfc3339())
}

fn log_phase(phase: &str, purged: u64) {
    if purged > 0 {
        info!(phase, purged, "purged aged rows");
    } else {
        debug!(phase, "nothing to purge");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(ttl_days: u32) -> GarbageCollectorConfig {
        GarbageCollectorConfig {
            collection_interval_secs: 600,
            sleep_delay_secs: 0,
            ttl_trigger_instances_days: ttl_days,
            ttl_executions_days: ttl_days,
            ttl_traces_days: ttl_days,
            ttl_enforcements_days: ttl_days,
        }
    }

    async fn setup(ttl_days: u32) -> (TempDir, Arc<Store>, Arc<GarbageCollector>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path()).await.unwrap());
        let gc = GarbageCollector::new(Arc::clone(&store), config(ttl_days));
        (dir, store, gc)
    }

    #[tokio::test]
    async fn purges_aged_instances_and_keeps_fresh_ones() {
        let (_dir, store, gc) = setup(7).await;
        let old = (Utc::now() - ChronoDuration::days(30)).to_rfc3339();
        store
            .create_trigger_instance("core.old", &json!({}), &old, None)
            .await
            .unwrap();
        let fresh = store
            .create_trigger_instance("core.fresh", &json!({}), &Utc::now().to_rfc3339(), None)
            .await
            .unwrap();

        gc.collect().await.unwrap();

        let cutoff = (Utc::now() - ChronoDuration::seconds(1)).to_rfc3339();
        let remaining = store
            .list_pending_trigger_instances(&Utc::now().to_rfc3339(), 100)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1, "cutoff was {cutoff}");
        assert_eq!(remaining[0].id, fresh.id);
    }

    #[tokio::test]
    async fn purges_only_terminal_executions() {
        let (_dir, store, gc) = setup(7).await;
        let action = store
            .register_action("core", "local", "local-shell-cmd", &json!({}), None)
            .await
            .unwrap();
        let (done, _) = store
            .create_live_action_pair(&action, &json!({}), &json!({}), None, None)
            .await
            .unwrap();
        let (live, _) = store
            .create_live_action_pair(&action, &json!({}), &json!({}), None, None)
            .await
            .unwrap();
        store
            .claim_live_action(&done.id, &[ExecutionStatus::Requested], ExecutionStatus::Canceled)
            .await
            .unwrap();
        // Age the terminal execution past the TTL.
        let old = (Utc::now() - ChronoDuration::days(30)).to_rfc3339();
        sqlx::query("UPDATE live_actions SET end_timestamp = ? WHERE id = ?")
            .bind(&old)
            .bind(&done.id)
            .execute(&store.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE action_executions SET end_timestamp = ? WHERE liveaction_id = ?")
            .bind(&old)
            .bind(&done.id)
            .execute(&store.pool())
            .await
            .unwrap();

        gc.collect().await.unwrap();

        assert!(store.get_live_action(&done.id).await.is_err());
        assert!(store.get_live_action(&live.id).await.is_ok());
    }

    #[tokio::test]
    async fn zero_ttl_disables_the_phase() {
        let (_dir, store, gc) = setup(0).await;
        let old = (Utc::now() - ChronoDuration::days(365)).to_rfc3339();
        store
            .create_trigger_instance("core.old", &json!({}), &old, None)
            .await
            .unwrap();

        gc.collect().await.unwrap();

        let remaining = store
            .list_pending_trigger_instances(&Utc::now().to_rfc3339(), 100)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn expired_kv_pairs_are_always_purged() {
        let (_dir, store, gc) = setup(0).await;
        let past = (Utc::now() - ChronoDuration::minutes(5)).to_rfc3339();
        store
            .set_kv("system", "stale", "v", false, Some(&past))
            .await
            .unwrap();
        store.set_kv("system", "live", "v", false, None).await.unwrap();

        gc.collect().await.unwrap();

        assert!(store.get_kv("system", "stale").await.is_err());
        assert!(store.get_kv("system", "live").await.is_ok());
    }
}
