//! Execution cancellation.
//!
//! Pre-run statuses cancel directly with a guarded claim. Running executions
//! move to `canceling` and the in-process worker is signaled through the
//! cancel registry; the worker drops the run future, calls the runner's
//! best-effort `cancel`, and finalizes `canceled`. If no local worker holds
//! the execution (it died before finishing), the service finalizes directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{exchanges, MessageBus};
use crate::models::ExecutionStatus;
use crate::store::{Store, StoreError};

/// Live map of in-flight runs to their cancellation signals.
#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl CancelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called by the worker when a run starts. The returned receiver fires
    /// when a cancel is requested.
    pub fn register(&self, liveaction_id: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.inner
            .lock()
            .expect("cancel registry mutex poisoned")
            .insert(liveaction_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, liveaction_id: &str) {
        self.inner
            .lock()
            .expect("cancel registry mutex poisoned")
            .remove(liveaction_id);
    }

    /// Signal a running execution. Returns false when no local worker holds
    /// it.
    pub fn signal(&self, liveaction_id: &str) -> bool {
        let inner = self.inner.lock().expect("cancel registry mutex poisoned");
        match inner.get(liveaction_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }
}

pub struct CancelService {
    store: Arc<Store>,
    bus: Arc<MessageBus>,
    cancels: Arc<CancelRegistry>,
}

impl CancelService {
    pub fn new(store: Arc<Store>, bus: Arc<MessageBus>, cancels: Arc<CancelRegistry>) -> Arc<Self> {
        Arc::new(Self { store, bus, cancels })
    }

    /// Request cancellation of one execution. Idempotent; canceling an
    /// already-terminal execution is a no-op.
    pub async fn cancel(&self, liveaction_id: &str) -> Result<(), StoreError> {
        let live = self.store.get_live_action(liveaction_id).await?;
        let status = live
            .status_enum()
            .ok_or_else(|| StoreError::Malformed(format!("live action {liveaction_id} has unknown status")))?;

        match status {
            ExecutionStatus::Requested | ExecutionStatus::Delayed | ExecutionStatus::Scheduled => {
                // Pre-run: terminal cancel without ever invoking the runner.
                if let Some(claimed) = self
                    .store
                    .claim_live_action(liveaction_id, &[status], ExecutionStatus::Canceled)
                    .await?
                {
                    info!(liveaction = %liveaction_id, from = %status, "execution canceled");
                    self.publish_status(&claimed, "canceled").await;
                }
            }
            ExecutionStatus::Running => {
                let Some(claimed) = self
                    .store
                    .claim_live_action(liveaction_id, &[ExecutionStatus::Running], ExecutionStatus::Canceling)
                    .await?
                else {
                    debug!(liveaction = %liveaction_id, "cancel lost the canceling claim");
                    return Ok(());
                };
                self.publish_status(&claimed, "canceling").await;
                if !self.cancels.signal(liveaction_id) {
                    // No worker holds it; finalize here.
                    warn!(liveaction = %liveaction_id, "no in-flight run to signal, finalizing");
                    if let Some(done) = self
                        .store
                        .claim_live_action(
                            liveaction_id,
                            &[ExecutionStatus::Canceling],
                            ExecutionStatus::Canceled,
                        )
                        .await?
                    {
                        self.publish_status(&done, "canceled").await;
                    }
                }
            }
            ExecutionStatus::Canceling
            | ExecutionStatus::Canceled
            | ExecutionStatus::Succeeded
            | ExecutionStatus::Failed => {
                debug!(liveaction = %liveaction_id, status = %status, "cancel is a no-op");
            }
        }
        Ok(())
    }

    async fn publish_status(&self, live: &crate::models::LiveActionRow, status: &str) {
        let body = serde_json::to_value(live).unwrap_or_else(|_| json!({}));
        if let Err(e) = self
            .bus
            .publish(exchanges::LIVEACTION_STATUS, status, body)
            .await
        {
            warn!(liveaction = %live.id, status, "status publish failed: {e}");
        }
    }
}
