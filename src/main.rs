use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use triggerd::config::DaemonConfig;
use triggerd::models::ExecutionStatus;
use triggerd::store::ExecutionFilter;
use triggerd::AppContext;

#[derive(Parser)]
#[command(
    name = "triggerd",
    about = "triggerd — event-driven automation daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Configuration file (TOML). Missing file falls back to defaults.
    #[arg(long, env = "TRIGGERD_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for the SQLite database (overrides [database].data_dir)
    #[arg(long, env = "TRIGGERD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TRIGGERD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "TRIGGERD_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground (default when no subcommand given).
    Serve,
    /// Dispatch one trigger instance into the pipeline.
    ///
    /// Thin producer: the instance is persisted `pending` and published; a
    /// running daemon against the same data directory picks it up (directly
    /// via the outbox sweep when this process exits before delivery).
    ///
    /// Examples:
    ///   triggerd dispatch core.st2.webhook '{"body": {"host": "h1"}}'
    Dispatch {
        /// Trigger ref (`pack.name`)
        trigger_ref: String,
        /// Payload as a JSON document
        payload: String,
        /// When the event happened (RFC 3339); defaults to now
        #[arg(long)]
        occurrence_time: Option<String>,
        /// Correlate with an existing trace instead of opening a new one
        #[arg(long)]
        trace_tag: Option<String>,
    },
    /// Manage rules.
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },
    /// Inspect and cancel executions.
    Execution {
        #[command(subcommand)]
        action: ExecutionAction,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    /// Create or update a rule from a JSON definition file.
    ///
    /// The file holds `{pack, name, trigger_ref, criteria, action_ref,
    /// action_parameters, context, enabled}`; `criteria`, parameters and
    /// context default to empty objects.
    Apply {
        /// Path to the rule definition (JSON)
        file: PathBuf,
    },
    /// List rules bound to a trigger ref.
    List {
        trigger_ref: String,
    },
    /// Delete a rule by ref (`pack.name`).
    Delete {
        #[arg(value_name = "REF")]
        ref_: String,
    },
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// List recent executions, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Print one execution as JSON.
    Get {
        id: String,
    },
    /// Request cancellation of an execution by its live action id.
    Cancel {
        liveaction_id: String,
    },
}

fn init_tracing(level: Option<&str>, log_file: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path.file_name().map(|n| n.to_string_lossy().to_string());
            let appender =
                tracing_appender::rolling::daily(dir, name.as_deref().unwrap_or("triggerd.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log.as_deref(), args.log_file.as_ref());

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(data_dir) = args.data_dir {
        config.database.data_dir = data_dir;
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Dispatch {
            trigger_ref,
            payload,
            occurrence_time,
            trace_tag,
        } => {
            dispatch(
                config,
                &trigger_ref,
                &payload,
                occurrence_time.as_deref(),
                trace_tag.as_deref(),
            )
            .await
        }
        Command::Rule { action } => rule(config, action).await,
        Command::Execution { action } => execution(config, action).await,
    }
}

async fn serve(config: DaemonConfig) -> Result<()> {
    let ctx = AppContext::init(config).await?;
    ctx.spawn_components().await?;
    info!(
        data_dir = %ctx.config.database.data_dir.display(),
        "triggerd running, ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    Ok(())
}

async fn dispatch(
    config: DaemonConfig,
    trigger_ref: &str,
    payload: &str,
    occurrence_time: Option<&str>,
    trace_tag: Option<&str>,
) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("payload is not valid JSON")?;
    let ctx = AppContext::init(config).await?;
    let instance = ctx
        .dispatcher
        .dispatch(trigger_ref, &payload, occurrence_time, trace_tag)
        .await
        .with_context(|| format!("dispatch {trigger_ref}"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "id": instance.id,
            "trigger_ref": instance.trigger_ref,
            "trace_tag": instance.trace_tag,
            "status": instance.status,
        }))?
    );
    Ok(())
}

async fn rule(config: DaemonConfig, action: RuleAction) -> Result<()> {
    let ctx = AppContext::init(config).await?;
    match action {
        RuleAction::Apply { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("read {}", file.display()))?;
            let def: Value = serde_json::from_str(&raw)
                .with_context(|| format!("parse {}", file.display()))?;
            let field = |name: &str| -> Result<String> {
                def.get(name)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .with_context(|| format!("rule definition is missing '{name}'"))
            };
            let empty = json!({});
            let rule = ctx
                .store
                .add_or_update_rule(
                    &field("pack")?,
                    &field("name")?,
                    def.get("enabled").and_then(Value::as_bool).unwrap_or(true),
                    &field("trigger_ref")?,
                    def.get("criteria").unwrap_or(&empty),
                    &field("action_ref")?,
                    def.get("action_parameters").unwrap_or(&empty),
                    def.get("context").unwrap_or(&empty),
                )
                .await?;
            println!("applied rule {}", rule.ref_);
        }
        RuleAction::List { trigger_ref } => {
            for rule in ctx.store.list_enabled_rules_for_trigger(&trigger_ref).await? {
                println!("{}\t{}\t->\t{}", rule.ref_, rule.trigger_ref, rule.action_ref);
            }
        }
        RuleAction::Delete { ref_ } => {
            ctx.store.delete_rule(&ref_).await?;
            println!("deleted rule {ref_}");
        }
    }
    Ok(())
}

async fn execution(config: DaemonConfig, action: ExecutionAction) -> Result<()> {
    let ctx = AppContext::init(config).await?;
    match action {
        ExecutionAction::List { status, limit } => {
            let statuses = match status.as_deref() {
                Some(s) => vec![ExecutionStatus::parse(s)
                    .with_context(|| format!("unknown status '{s}'"))?],
                None => Vec::new(),
            };
            let filter = ExecutionFilter {
                statuses,
                limit: Some(limit),
                newest_first: true,
                ..Default::default()
            };
            for exec in ctx.store.query_executions(&filter).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    exec.id,
                    exec.status,
                    exec.action_ref,
                    exec.end_timestamp.as_deref().unwrap_or("-")
                );
            }
        }
        ExecutionAction::Get { id } => {
            let exec = ctx.store.get_execution(&id).await?;
            println!("{}", serde_json::to_string_pretty(&exec)?);
        }
        ExecutionAction::Cancel { liveaction_id } => {
            ctx.cancel_service.cancel(&liveaction_id).await?;
            let live = ctx.store.get_live_action(&liveaction_id).await?;
            println!("{}\t{}", live.id, live.status);
        }
    }
    Ok(())
}
