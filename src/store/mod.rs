//! Typed persistence over SQLite.
//!
//! One `Store` wraps the shared connection pool; per-entity operations live in
//! the submodules as further `impl Store` blocks. All unique constraints are
//! enforced here (unique indexes), never in callers. Claim-style updates
//! (`requested → scheduled`, revision bumps) are single guarded UPDATE
//! statements — the database row is the lock.

mod enforcements;
mod execution_states;
mod executions;
mod kv;
mod policies;
mod rules;
mod runner_types;
mod tokens;
mod traces;
mod triggers;

pub use executions::ExecutionFilter;
pub use traces::TraceComponent;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::bus::MessageBus;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Typed store errors, stable across the core.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("write conflict: {0}")]
    WriteConflict(String),
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("query timed out after {0}s")]
    Timeout(u64),
}

impl StoreError {
    /// Map a unique-constraint violation onto `Duplicate`, everything else
    /// onto `Database`.
    pub(crate) fn from_write(err: sqlx::Error, what: &str) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.message().contains("UNIQUE constraint failed") {
                return StoreError::Duplicate(what.to_string());
            }
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Execute a future with the standard query timeout.
pub(crate) async fn with_timeout<T>(
    fut: impl std::future::Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(QUERY_TIMEOUT.as_secs())),
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    /// Bound when the bus is up; `add_or_update` for CUD model families
    /// publishes create/update/delete through it.
    bus: Arc<RwLock<Option<Arc<MessageBus>>>>,
}

impl Store {
    pub async fn new(data_dir: &Path) -> StoreResult<Self> {
        Self::new_with_slow_query(data_dir, 0).await
    }

    /// Create the store with slow-query logging enabled. `slow_query_ms` is
    /// the WARN threshold in milliseconds; 0 disables it.
    pub async fn new_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> StoreResult<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| StoreError::Malformed(format!("create {}: {e}", data_dir.display())))?;
        let db_path = data_dir.join("triggerd.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))
                .map_err(StoreError::Database)?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            use sqlx::ConnectOptions;
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self {
            pool,
            bus: Arc::new(RwLock::new(None)),
        })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Bind the message bus so CUD-publishing store operations emit events.
    pub async fn bind_bus(&self, bus: Arc<MessageBus>) {
        *self.bus.write().await = Some(bus);
    }

    pub(crate) async fn bound_bus(&self) -> Option<Arc<MessageBus>> {
        self.bus.read().await.clone()
    }

    async fn migrate(pool: &SqlitePool) -> StoreResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(pool).await?;
        }

        // Idempotent column additions (SQLite has no ALTER TABLE IF NOT
        // EXISTS, so attempt the ALTER and ignore "duplicate column name").
        let alter_stmts: [&str; 0] = [];
        for stmt in alter_stmts {
            if let Err(e) = sqlx::query(stmt).execute(pool).await {
                if !e.to_string().contains("duplicate column") {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS trigger_types (
        id TEXT PRIMARY KEY,
        ref TEXT NOT NULL UNIQUE,
        pack TEXT NOT NULL,
        name TEXT NOT NULL,
        parameters_schema TEXT NOT NULL DEFAULT '{}',
        payload_schema TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        UNIQUE (pack, name)
    )",
    "CREATE TABLE IF NOT EXISTS triggers (
        id TEXT PRIMARY KEY,
        ref TEXT NOT NULL UNIQUE,
        type_ref TEXT NOT NULL,
        parameters TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        UNIQUE (type_ref, parameters)
    )",
    "CREATE TABLE IF NOT EXISTS trigger_instances (
        id TEXT PRIMARY KEY,
        trigger_ref TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        occurrence_time TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        trace_tag TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_trigger_instances_ref
        ON trigger_instances (trigger_ref)",
    "CREATE INDEX IF NOT EXISTS idx_trigger_instances_status
        ON trigger_instances (status)",
    "CREATE INDEX IF NOT EXISTS idx_trigger_instances_occurrence
        ON trigger_instances (occurrence_time)",
    "CREATE TABLE IF NOT EXISTS rules (
        id TEXT PRIMARY KEY,
        ref TEXT NOT NULL UNIQUE,
        pack TEXT NOT NULL,
        name TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        trigger_ref TEXT NOT NULL,
        criteria TEXT NOT NULL DEFAULT '{}',
        action_ref TEXT NOT NULL,
        action_parameters TEXT NOT NULL DEFAULT '{}',
        context TEXT NOT NULL DEFAULT '{}',
        updated_at TEXT NOT NULL,
        UNIQUE (pack, name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_rules_trigger_ref ON rules (trigger_ref)",
    "CREATE TABLE IF NOT EXISTS actions (
        id TEXT PRIMARY KEY,
        ref TEXT NOT NULL UNIQUE,
        pack TEXT NOT NULL,
        name TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        runner_type TEXT NOT NULL,
        parameters TEXT NOT NULL DEFAULT '{}',
        notify TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (pack, name)
    )",
    "CREATE TABLE IF NOT EXISTS live_actions (
        id TEXT PRIMARY KEY,
        action_ref TEXT NOT NULL,
        runner_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'requested',
        parameters TEXT NOT NULL DEFAULT '{}',
        context TEXT NOT NULL DEFAULT '{}',
        start_timestamp TEXT,
        end_timestamp TEXT,
        result TEXT,
        runner_info TEXT,
        notify TEXT,
        revision INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_live_actions_status ON live_actions (status)",
    "CREATE INDEX IF NOT EXISTS idx_live_actions_action_ref
        ON live_actions (action_ref, status)",
    "CREATE TABLE IF NOT EXISTS action_executions (
        id TEXT PRIMARY KEY,
        liveaction_id TEXT NOT NULL UNIQUE,
        action_ref TEXT NOT NULL,
        runner_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'requested',
        parameters TEXT NOT NULL DEFAULT '{}',
        context TEXT NOT NULL DEFAULT '{}',
        trigger_instance_id TEXT,
        rule_id TEXT,
        start_timestamp TEXT,
        end_timestamp TEXT,
        result TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_action_executions_status
        ON action_executions (status)",
    "CREATE INDEX IF NOT EXISTS idx_action_executions_end
        ON action_executions (end_timestamp)",
    "CREATE TABLE IF NOT EXISTS rule_enforcements (
        id TEXT PRIMARY KEY,
        trigger_instance_id TEXT NOT NULL,
        rule_id TEXT NOT NULL,
        rule_ref TEXT NOT NULL,
        execution_id TEXT,
        status TEXT NOT NULL,
        failure_reason TEXT,
        enforced_at TEXT NOT NULL,
        UNIQUE (trigger_instance_id, rule_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_rule_enforcements_enforced
        ON rule_enforcements (enforced_at)",
    "CREATE TABLE IF NOT EXISTS policies (
        id TEXT PRIMARY KEY,
        ref TEXT NOT NULL UNIQUE,
        pack TEXT NOT NULL,
        name TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        resource_ref TEXT NOT NULL,
        policy_type TEXT NOT NULL,
        parameters TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        UNIQUE (resource_ref, policy_type, name)
    )",
    "CREATE TABLE IF NOT EXISTS runner_types (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        runner_module TEXT NOT NULL,
        runner_parameters TEXT NOT NULL DEFAULT '{}',
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS action_execution_states (
        id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL UNIQUE,
        query_module TEXT NOT NULL,
        query_context TEXT NOT NULL DEFAULT '{}',
        last_query_time TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS traces (
        id TEXT PRIMARY KEY,
        trace_tag TEXT NOT NULL,
        trigger_instances TEXT NOT NULL DEFAULT '[]',
        rules TEXT NOT NULL DEFAULT '[]',
        action_executions TEXT NOT NULL DEFAULT '[]',
        start_timestamp TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_traces_tag ON traces (trace_tag)",
    "CREATE TABLE IF NOT EXISTS tokens (
        id TEXT PRIMARY KEY,
        user TEXT NOT NULL,
        token TEXT NOT NULL UNIQUE,
        expiry TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS key_value_pairs (
        id TEXT PRIMARY KEY,
        scope TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        secret INTEGER NOT NULL DEFAULT 0,
        expire_timestamp TEXT,
        UNIQUE (scope, name)
    )",
    "CREATE TABLE IF NOT EXISTS notification_deliveries (
        id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        route TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE (execution_id, route)
    )",
];
