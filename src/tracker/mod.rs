//! Results tracker for asynchronous executions.
//!
//! Scans state records whose execution is still `running` on a fixed
//! interval and polls the owning query module. Per-record exponential
//! backoff (capped at `max_backoff`) spaces out failing queries; after
//! `max_query_retries` consecutive failures the execution is failed with a
//! `query-module-error` result and the state record is deleted.

pub mod queriers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::bus::{exchanges, MessageBus};
use crate::config::ResultsTrackerConfig;
use crate::models::{error_result, ActionExecutionStateRow, ErrorKind, ExecutionStatus};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum QuerierError {
    #[error("query failed: {0}")]
    Failed(String),
}

/// Outcome of one poll against the external system.
#[derive(Debug, Clone)]
pub enum QueryVerdict {
    StillRunning,
    Done {
        status: ExecutionStatus,
        result: Value,
    },
}

/// Polls an external system for the final result of one execution.
#[async_trait]
pub trait Querier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn query(
        &self,
        execution_id: &str,
        query_context: &Value,
        last_query_time: Option<DateTime<Utc>>,
    ) -> Result<QueryVerdict, QuerierError>;
}

/// Query-module name → querier table.
#[derive(Default)]
pub struct QuerierRegistry {
    queriers: HashMap<&'static str, Arc<dyn Querier>>,
}

impl QuerierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(queriers::MockAsyncQuerier::new()));
        registry
    }

    pub fn register(&mut self, querier: Arc<dyn Querier>) {
        self.queriers.insert(querier.name(), querier);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Querier>> {
        self.queriers.get(name).cloned()
    }
}

pub struct ResultsTracker {
    store: Arc<Store>,
    bus: Arc<MessageBus>,
    queriers: Arc<QuerierRegistry>,
    config: ResultsTrackerConfig,
}

impl ResultsTracker {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<MessageBus>,
        queriers: Arc<QuerierRegistry>,
        config: ResultsTrackerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            queriers,
            config,
        })
    }

    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.query_interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.tick().await {
                warn!("tracker scan failed: {e}");
            }
        }
    }

    /// One scan: poll every due state record, bounded by `pool_size`.
    pub async fn tick(self: &Arc<Self>) -> Result<(), StoreError> {
        let states = self.store.list_states_for_running_executions().await?;
        if states.is_empty() {
            return Ok(());
        }
        debug!(records = states.len(), "tracker scan");
        let semaphore = Arc::new(Semaphore::new(self.config.pool_size.max(1)));
        let mut handles = Vec::new();
        for state in states {
            if !self.is_due(&state) {
                continue;
            }
            let tracker = Arc::clone(self);
            let permit = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await;
                if let Err(e) = tracker.process_state(&state).await {
                    warn!(execution = %state.execution_id, "state poll failed: {e}");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Exponential backoff gate: `2^retry_count` seconds since the last
    /// query, capped at `max_backoff`.
    fn is_due(&self, state: &ActionExecutionStateRow) -> bool {
        let Some(last) = state.last_query_time_utc() else {
            return true;
        };
        if state.retry_count == 0 {
            return true;
        }
        let backoff = 2u64
            .saturating_pow(state.retry_count.clamp(0, 32) as u32)
            .min(self.config.max_backoff_secs.max(1));
        Utc::now() >= last + chrono::Duration::seconds(backoff as i64)
    }

    pub async fn process_state(&self, state: &ActionExecutionStateRow) -> Result<(), StoreError> {
        let Some(querier) = self.queriers.get(&state.query_module) else {
            let msg = format!("query module '{}' is not registered", state.query_module);
            warn!(execution = %state.execution_id, "{msg}");
            self.fail_execution(state, &msg).await?;
            return Ok(());
        };

        match querier
            .query(
                &state.execution_id,
                &state.query_context_value(),
                state.last_query_time_utc(),
            )
            .await
        {
            Ok(QueryVerdict::StillRunning) => {
                debug!(execution = %state.execution_id, "still running");
                self.store.touch_execution_state(&state.id, 0).await?;
            }
            Ok(QueryVerdict::Done { status, result }) => {
                self.complete_execution(state, status, result).await?;
            }
            Err(e) => {
                let retries = state.retry_count + 1;
                if retries > self.config.max_query_retries as i64 {
                    let msg = format!(
                        "query module '{}' failed {retries} times: {e}",
                        state.query_module
                    );
                    warn!(execution = %state.execution_id, "{msg}");
                    self.fail_execution(state, &msg).await?;
                } else {
                    debug!(execution = %state.execution_id, retries, "query failed, backing off: {e}");
                    self.store.touch_execution_state(&state.id, retries).await?;
                }
            }
        }
        Ok(())
    }

    /// Write the terminal result reported by the external system.
    async fn complete_execution(
        &self,
        state: &ActionExecutionStateRow,
        status: ExecutionStatus,
        result: Value,
    ) -> Result<(), StoreError> {
        let execution = self.store.get_execution(&state.execution_id).await?;
        let live = self.store.get_live_action(&execution.liveaction_id).await?;
        match self
            .store
            .update_live_action_status(&live.id, live.revision, status, Some(&result), None)
            .await
        {
            Ok(updated) => {
                info!(execution = %state.execution_id, status = %status, "async execution completed");
                let body = serde_json::to_value(&updated).unwrap_or_default();
                let _ = self
                    .bus
                    .publish(exchanges::LIVEACTION_STATUS, status.as_str(), body)
                    .await;
            }
            Err(StoreError::WriteConflict(_) | StoreError::Malformed(_)) => {
                // A cancel or another writer beat us; their state stands.
                debug!(execution = %state.execution_id, "completion lost a race");
            }
            Err(e) => return Err(e),
        }
        self.store.delete_execution_state(&state.id).await
    }

    async fn fail_execution(
        &self,
        state: &ActionExecutionStateRow,
        message: &str,
    ) -> Result<(), StoreError> {
        let result = error_result(ErrorKind::QueryModuleError, message);
        self.complete_execution(state, ExecutionStatus::Failed, result)
            .await
    }
}
