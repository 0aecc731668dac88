//! Core entity types shared by every component.
//!
//! Rows map 1:1 onto SQLite tables (see `store::schema`). JSON-bearing
//! columns are stored as TEXT and decoded on use via the `*_value` helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generate a new UUID v4 record id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a new ULID trace tag.
pub fn new_trace_tag() -> String {
    ulid::Ulid::new().to_string()
}

/// Current UTC time serialized the way every timestamp column stores it.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn decode_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

// ─── Execution status state machine ───────────────────────────────────────────

/// Status of a live action / action execution pair.
///
/// The status column is the single authoritative state; transitions are
/// validated by [`ExecutionStatus::can_transition_to`] and enforced in the
/// store by guarded updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Requested,
    Scheduled,
    Delayed,
    Running,
    Canceling,
    Succeeded,
    Failed,
    Canceled,
}

impl ExecutionStatus {
    pub const TERMINAL: &'static [ExecutionStatus] =
        &[Self::Succeeded, Self::Failed, Self::Canceled];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Scheduled => "scheduled",
            Self::Delayed => "delayed",
            Self::Running => "running",
            Self::Canceling => "canceling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "scheduled" => Some(Self::Scheduled),
            "delayed" => Some(Self::Delayed),
            "running" => Some(Self::Running),
            "canceling" => Some(Self::Canceling),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Legal edges of the state machine. No other transition is ever written.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Requested, Scheduled)
                | (Requested, Delayed)
                | (Requested, Canceled)
                | (Scheduled, Running)
                | (Scheduled, Canceled)
                | (Scheduled, Requested) // startup recovery of stuck claims
                | (Delayed, Requested)
                | (Delayed, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceling)
                | (Running, Canceled)
                | (Canceling, Canceled)
                | (Canceling, Failed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Trigger instance status ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerInstanceStatus {
    Pending,
    Processing,
    Processed,
    ProcessingFailed,
}

impl TriggerInstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::ProcessingFailed => "processing_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "processing_failed" => Some(Self::ProcessingFailed),
            _ => None,
        }
    }
}

// ─── Error kinds ──────────────────────────────────────────────────────────────

/// Stable machine-readable error kinds carried in terminal results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    Duplicate,
    WriteConflict,
    ValidationError,
    TemplateError,
    PolicyRejected,
    RunnerError,
    RunnerTimeout,
    BusUnavailable,
    QueryModuleError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::Duplicate => "duplicate",
            Self::WriteConflict => "write-conflict",
            Self::ValidationError => "validation-error",
            Self::TemplateError => "template-error",
            Self::PolicyRejected => "policy-rejected",
            Self::RunnerError => "runner-error",
            Self::RunnerTimeout => "runner-timeout",
            Self::BusUnavailable => "bus-unavailable",
            Self::QueryModuleError => "query-module-error",
        }
    }
}

/// Build the structured `result` document written for a terminal failure.
pub fn error_result(kind: ErrorKind, message: &str) -> Value {
    serde_json::json!({
        "error": message,
        "error_kind": kind.as_str(),
    })
}

// ─── Trigger types and triggers ───────────────────────────────────────────────

/// Schema-bearing trigger type definition, addressable by `"pack.name"`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TriggerTypeRow {
    pub id: String,
    #[sqlx(rename = "ref")]
    #[serde(rename = "ref")]
    pub ref_: String,
    pub pack: String,
    pub name: String,
    pub parameters_schema: String,
    pub payload_schema: String,
    pub created_at: String,
}

impl TriggerTypeRow {
    pub fn payload_schema_value(&self) -> Value {
        decode_json(&self.payload_schema)
    }
}

/// Concrete instantiation of a trigger type with bound parameters.
/// Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TriggerRow {
    pub id: String,
    #[sqlx(rename = "ref")]
    #[serde(rename = "ref")]
    pub ref_: String,
    pub type_ref: String,
    pub parameters: String,
    pub created_at: String,
}

impl TriggerRow {
    pub fn parameters_value(&self) -> Value {
        decode_json(&self.parameters)
    }
}

/// One occurrence of a trigger. Payload is immutable; only `status` moves.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TriggerInstanceRow {
    pub id: String,
    pub trigger_ref: String,
    pub payload: String,
    pub occurrence_time: String,
    pub status: String,
    pub trace_tag: Option<String>,
}

impl TriggerInstanceRow {
    pub fn payload_value(&self) -> Value {
        decode_json(&self.payload)
    }

    pub fn status_enum(&self) -> Option<TriggerInstanceStatus> {
        TriggerInstanceStatus::parse(&self.status)
    }
}

// ─── Rules ────────────────────────────────────────────────────────────────────

/// A predicate over trigger instances plus an action to invoke on match.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RuleRow {
    pub id: String,
    #[sqlx(rename = "ref")]
    #[serde(rename = "ref")]
    pub ref_: String,
    pub pack: String,
    pub name: String,
    pub enabled: bool,
    pub trigger_ref: String,
    /// Ordered map `field-path → {type, pattern, [condition]}` (JSON object).
    pub criteria: String,
    pub action_ref: String,
    /// Parameters template rendered per trigger instance (JSON object).
    pub action_parameters: String,
    /// Static map merged into the template context.
    pub context: String,
    pub updated_at: String,
}

impl RuleRow {
    pub fn criteria_value(&self) -> Value {
        decode_json(&self.criteria)
    }

    pub fn action_parameters_value(&self) -> Value {
        decode_json(&self.action_parameters)
    }

    pub fn context_value(&self) -> Value {
        decode_json(&self.context)
    }
}

// ─── Actions ──────────────────────────────────────────────────────────────────

/// Registered action: binds a ref to a runner type, default parameters and an
/// optional notify block. Registered at bootstrap; rules point at these.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActionRow {
    pub id: String,
    #[sqlx(rename = "ref")]
    #[serde(rename = "ref")]
    pub ref_: String,
    pub pack: String,
    pub name: String,
    pub enabled: bool,
    pub runner_type: String,
    /// Default parameter values merged under rendered rule parameters.
    pub parameters: String,
    /// Optional notify block `{on_success, on_failure, on_complete}`.
    pub notify: Option<String>,
    pub created_at: String,
}

impl ActionRow {
    pub fn parameters_value(&self) -> Value {
        decode_json(&self.parameters)
    }

    pub fn notify_value(&self) -> Option<Value> {
        self.notify.as_deref().map(decode_json)
    }
}

// ─── Live actions / executions ────────────────────────────────────────────────

/// Runtime intent record of one action invocation.
///
/// `revision` implements optimistic concurrency: every status write bumps it
/// and carries the expected prior value, so observers can never interleave a
/// transition that violates the state machine.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LiveActionRow {
    pub id: String,
    pub action_ref: String,
    pub runner_type: String,
    pub status: String,
    /// Rendered parameters (JSON object).
    pub parameters: String,
    /// Origin context: trigger instance id, rule id/ref, user, trace tag, parent.
    pub context: String,
    pub start_timestamp: Option<String>,
    pub end_timestamp: Option<String>,
    pub result: Option<String>,
    pub runner_info: Option<String>,
    pub notify: Option<String>,
    pub revision: i64,
    pub created_at: String,
}

impl LiveActionRow {
    pub fn status_enum(&self) -> Option<ExecutionStatus> {
        ExecutionStatus::parse(&self.status)
    }

    pub fn parameters_value(&self) -> Value {
        decode_json(&self.parameters)
    }

    pub fn context_value(&self) -> Value {
        decode_json(&self.context)
    }

    pub fn result_value(&self) -> Value {
        self.result.as_deref().map(decode_json).unwrap_or(Value::Null)
    }

    pub fn notify_value(&self) -> Option<Value> {
        self.notify.as_deref().map(decode_json)
    }
}

/// Status-bearing mirror of a live action, used by observers and audit.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActionExecutionRow {
    pub id: String,
    pub liveaction_id: String,
    pub action_ref: String,
    pub runner_type: String,
    pub status: String,
    pub parameters: String,
    pub context: String,
    pub trigger_instance_id: Option<String>,
    pub rule_id: Option<String>,
    pub start_timestamp: Option<String>,
    pub end_timestamp: Option<String>,
    pub result: Option<String>,
    pub created_at: String,
}

impl ActionExecutionRow {
    pub fn status_enum(&self) -> Option<ExecutionStatus> {
        ExecutionStatus::parse(&self.status)
    }

    pub fn result_value(&self) -> Value {
        self.result.as_deref().map(decode_json).unwrap_or(Value::Null)
    }
}

// ─── Rule enforcements ────────────────────────────────────────────────────────

pub const ENFORCEMENT_STATUS_SUCCEEDED: &str = "succeeded";
pub const ENFORCEMENT_STATUS_FAILED: &str = "failed";

/// Audit record of one rule × trigger-instance match.
///
/// Unique on `(trigger_instance_id, rule_id)` — this is the redelivery dedup
/// key for the rules engine.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RuleEnforcementRow {
    pub id: String,
    pub trigger_instance_id: String,
    pub rule_id: String,
    pub rule_ref: String,
    pub execution_id: Option<String>,
    pub status: String,
    pub failure_reason: Option<String>,
    pub enforced_at: String,
}

// ─── Policies ─────────────────────────────────────────────────────────────────

pub const POLICY_TYPE_CONCURRENCY: &str = "action.concurrency";
pub const POLICY_TYPE_RETRY: &str = "action.retry";

/// Admission-control rule attached to an action.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PolicyRow {
    pub id: String,
    #[sqlx(rename = "ref")]
    #[serde(rename = "ref")]
    pub ref_: String,
    pub pack: String,
    pub name: String,
    pub enabled: bool,
    /// Ref of the action the policy governs.
    pub resource_ref: String,
    pub policy_type: String,
    pub parameters: String,
    pub created_at: String,
}

impl PolicyRow {
    pub fn parameters_value(&self) -> Value {
        decode_json(&self.parameters)
    }
}

// ─── Runner types ─────────────────────────────────────────────────────────────

/// Immutable runner metadata bootstrapped at startup.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunnerTypeRow {
    pub id: String,
    pub name: String,
    pub runner_module: String,
    pub runner_parameters: String,
    pub enabled: bool,
    pub created_at: String,
}

// ─── Async execution state ────────────────────────────────────────────────────

/// Tracker handle for an asynchronous execution still running in an external
/// system. One row per execution; deleted when the execution completes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActionExecutionStateRow {
    pub id: String,
    pub execution_id: String,
    pub query_module: String,
    pub query_context: String,
    pub last_query_time: Option<String>,
    pub retry_count: i64,
    pub created_at: String,
}

impl ActionExecutionStateRow {
    pub fn query_context_value(&self) -> Value {
        decode_json(&self.query_context)
    }

    pub fn last_query_time_utc(&self) -> Option<DateTime<Utc>> {
        self.last_query_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

// ─── Traces, tokens, key-value pairs ─────────────────────────────────────────

/// Correlates trigger instances, rules and executions under one trace tag.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TraceRow {
    pub id: String,
    pub trace_tag: String,
    /// JSON arrays of component refs `{id, ref}` appended as the trace grows.
    pub trigger_instances: String,
    pub rules: String,
    pub action_executions: String,
    pub start_timestamp: String,
}

/// Auth token record. Issued by the external auth collaborator; the core only
/// stores and garbage-collects them.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TokenRow {
    pub id: String,
    pub user: String,
    pub token: String,
    pub expiry: String,
}

/// Key-value pair; `secret` values are stored AEAD-encrypted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct KeyValuePairRow {
    pub id: String,
    pub scope: String,
    pub name: String,
    pub value: String,
    pub secret: bool,
    pub expire_timestamp: Option<String>,
}

/// At-most-once notification delivery ledger, unique on `(execution_id, route)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationDeliveryRow {
    pub id: String,
    pub execution_id: String,
    pub route: String,
    pub status: String,
    pub attempts: i64,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Canceled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Canceling.is_terminal());
    }

    #[test]
    fn state_machine_edges() {
        use ExecutionStatus::*;
        assert!(Requested.can_transition_to(Scheduled));
        assert!(Requested.can_transition_to(Delayed));
        assert!(Requested.can_transition_to(Canceled));
        assert!(Scheduled.can_transition_to(Running));
        assert!(Delayed.can_transition_to(Requested));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Canceling.can_transition_to(Canceled));

        // Forbidden edges.
        assert!(!Requested.can_transition_to(Running));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Canceled.can_transition_to(Requested));
        assert!(!Delayed.can_transition_to(Running));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            "requested",
            "scheduled",
            "delayed",
            "running",
            "canceling",
            "succeeded",
            "failed",
            "canceled",
        ] {
            let parsed = ExecutionStatus::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!(ExecutionStatus::parse("bogus").is_none());
    }

    #[test]
    fn error_result_shape() {
        let r = error_result(ErrorKind::RunnerTimeout, "action timed out after 5s");
        assert_eq!(r["error_kind"], "runner-timeout");
        assert_eq!(r["error"], "action timed out after 5s");
    }
}
