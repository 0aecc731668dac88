//! Daemon configuration — `[section]` per component in `triggerd.toml`.
//!
//! Every section has serde defaults so a missing file yields a working
//! configuration; [`DaemonConfig::validate`] rejects values that would
//! violate hard invariants (zero timeouts, TTLs below the retention floor).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Retention floor for trigger instances, executions, traces and
/// enforcements, in days.
pub const MINIMUM_TTL_DAYS: u32 = 7;
/// Retention floor for execution output, in days.
pub const MINIMUM_TTL_DAYS_EXECUTION_OUTPUT: u32 = 1;

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/triggerd")
}

// ─── DatabaseConfig ───────────────────────────────────────────────────────────

/// `[database]` — SQLite location and query diagnostics.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding `triggerd.db` and WAL side files.
    pub data_dir: PathBuf,
    /// Slow-query WARN threshold in milliseconds. 0 disables.
    pub slow_query_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            slow_query_ms: 0,
        }
    }
}

// ─── MessagingConfig ──────────────────────────────────────────────────────────

/// `[messaging]` — bus exchange-name prefix and queue sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Prefix applied to every exchange name (multi-tenant test isolation).
    pub prefix: String,
    /// Per-queue capacity before publishes fail transiently.
    pub queue_capacity: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            queue_capacity: 10_000,
        }
    }
}

// ─── SchedulerConfig ──────────────────────────────────────────────────────────

/// `[scheduler]` — claim pool and delayed-execution handling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent claim handlers.
    pub pool_size: usize,
    /// How often delayed executions are re-examined, in seconds.
    pub rescheduling_interval_secs: u64,
    /// Executions stuck in `scheduled` longer than this are recovered back
    /// to `requested` at startup, in seconds.
    pub delayed_execution_recovery_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            rescheduling_interval_secs: 5,
            delayed_execution_recovery_secs: 600,
        }
    }
}

// ─── ActionRunnerConfig ───────────────────────────────────────────────────────

/// `[actionrunner]` — worker pool and runner defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ActionRunnerConfig {
    /// Concurrent runner invocations per worker process.
    pub pool_size: usize,
    /// Persist runner stdout/stderr into the result document.
    pub store_output: bool,
    /// Default execution timeout in seconds when the action does not set
    /// its own `timeout` runner parameter. Must be positive.
    pub default_timeout_secs: u64,
}

impl Default for ActionRunnerConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            store_output: true,
            default_timeout_secs: 60,
        }
    }
}

// ─── ResultsTrackerConfig ─────────────────────────────────────────────────────

/// `[resultstracker]` — polling cadence for async executions.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResultsTrackerConfig {
    /// Seconds between tracker scans.
    pub query_interval_secs: u64,
    /// Cap for the per-record exponential backoff, in seconds.
    pub max_backoff_secs: u64,
    /// Consecutive query failures tolerated before the execution is failed.
    pub max_query_retries: u32,
    /// Concurrent query-module invocations.
    pub pool_size: usize,
}

impl Default for ResultsTrackerConfig {
    fn default() -> Self {
        Self {
            query_interval_secs: 5,
            max_backoff_secs: 300,
            max_query_retries: 5,
            pool_size: 10,
        }
    }
}

// ─── GarbageCollectorConfig ───────────────────────────────────────────────────

/// `[garbagecollector]` — purge cadence and per-phase TTLs (days).
/// A TTL of 0 disables that phase.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GarbageCollectorConfig {
    pub collection_interval_secs: u64,
    /// Pause between purge phases, in seconds.
    pub sleep_delay_secs: u64,
    pub ttl_trigger_instances_days: u32,
    pub ttl_executions_days: u32,
    pub ttl_traces_days: u32,
    pub ttl_enforcements_days: u32,
}

impl Default for GarbageCollectorConfig {
    fn default() -> Self {
        Self {
            collection_interval_secs: 600,
            sleep_delay_secs: 2,
            ttl_trigger_instances_days: 0,
            ttl_executions_days: 0,
            ttl_traces_days: 0,
            ttl_enforcements_days: 0,
        }
    }
}

// ─── KeyValueConfig ───────────────────────────────────────────────────────────

/// `[keyvalue]` — encryption key for secret values and the `decrypt_kv`
/// template filter.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct KeyValueConfig {
    /// Path to the symmetric key file (hex). None disables secret storage.
    pub encryption_key_path: Option<PathBuf>,
}

// ─── NotifierConfig ───────────────────────────────────────────────────────────

/// `[notifier]` — delivery retry cap.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Attempts per `(execution, route)` before the delivery is dropped.
    pub max_delivery_attempts: u32,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 3,
        }
    }
}

// ─── RegistryConfig ───────────────────────────────────────────────────────────

/// `[registry]` — membership heartbeats.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_interval_secs: u64,
    /// Members missing heartbeats for this long are expired.
    pub heartbeat_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
        }
    }
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub database: DatabaseConfig,
    pub messaging: MessagingConfig,
    pub scheduler: SchedulerConfig,
    pub actionrunner: ActionRunnerConfig,
    pub resultstracker: ResultsTrackerConfig,
    pub garbagecollector: GarbageCollectorConfig,
    pub keyvalue: KeyValueConfig,
    pub notifier: NotifierConfig,
    pub registry: RegistryConfig,
}

impl DaemonConfig {
    /// Load from a TOML file, falling back to defaults when the file is
    /// missing. Validation runs in both cases.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("read {}", p.display()))?;
                let cfg: DaemonConfig =
                    toml::from_str(&raw).with_context(|| format!("parse {}", p.display()))?;
                debug!(path = %p.display(), "loaded configuration");
                cfg
            }
            Some(p) => {
                debug!(path = %p.display(), "config file missing, using defaults");
                DaemonConfig::default()
            }
            None => DaemonConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would violate hard invariants.
    pub fn validate(&self) -> Result<()> {
        if self.actionrunner.default_timeout_secs == 0 {
            bail!("actionrunner.default_timeout_secs must be positive");
        }
        if self.actionrunner.pool_size == 0 || self.scheduler.pool_size == 0 {
            bail!("worker pool sizes must be positive");
        }
        let gc = &self.garbagecollector;
        for (name, ttl) in [
            ("ttl_trigger_instances_days", gc.ttl_trigger_instances_days),
            ("ttl_executions_days", gc.ttl_executions_days),
            ("ttl_traces_days", gc.ttl_traces_days),
            ("ttl_enforcements_days", gc.ttl_enforcements_days),
        ] {
            if ttl > 0 && ttl < MINIMUM_TTL_DAYS {
                bail!(
                    "garbagecollector.{name} is {ttl} days; minimum is {MINIMUM_TTL_DAYS}"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DaemonConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut cfg = DaemonConfig::default();
        cfg.actionrunner.default_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ttl_below_minimum_is_rejected() {
        let mut cfg = DaemonConfig::default();
        cfg.garbagecollector.ttl_executions_days = 3;
        assert!(cfg.validate().is_err());

        cfg.garbagecollector.ttl_executions_days = 7;
        cfg.validate().unwrap();

        // 0 means disabled, which is always allowed.
        cfg.garbagecollector.ttl_executions_days = 0;
        cfg.validate().unwrap();
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: DaemonConfig = toml::from_str(
            r#"
            [scheduler]
            pool_size = 4

            [garbagecollector]
            ttl_executions_days = 30
            "#,
        )
        .unwrap();
        assert_eq!(cfg.scheduler.pool_size, 4);
        assert_eq!(cfg.garbagecollector.ttl_executions_days, 30);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.notifier.max_delivery_attempts, 3);
    }
}
