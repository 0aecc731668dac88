//! End-to-end pipeline tests: trigger dispatch through rules, scheduling,
//! running and terminal persistence, against a full `AppContext` on a
//! temp-dir database.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use triggerd::bus::exchanges;
use triggerd::config::DaemonConfig;
use triggerd::models::{ExecutionStatus, POLICY_TYPE_CONCURRENCY};
use triggerd::runners::{RUNNER_LOCAL_SHELL, RUNNER_MOCK_ASYNC};
use triggerd::store::ExecutionFilter;
use triggerd::AppContext;

async fn context_in(dir: &TempDir) -> AppContext {
    let mut config = DaemonConfig::default();
    config.database.data_dir = dir.path().to_path_buf();
    config.scheduler.rescheduling_interval_secs = 1;
    config.resultstracker.query_interval_secs = 1;
    AppContext::init(config).await.unwrap()
}

/// Poll until `check` yields `Some`, panicking after `secs` seconds.
async fn wait_for<T, F, Fut>(secs: u64, what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn executions_for(ctx: &AppContext, action_ref: &str) -> Vec<triggerd::models::ActionExecutionRow> {
    ctx.store
        .query_executions(&ExecutionFilter {
            action_ref: Some(action_ref.to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
}

fn echo_rule_definition() -> (Value, Value) {
    let criteria = json!({
        "trigger.body.host": {"type": "equals", "pattern": "h1"}
    });
    let parameters = json!({"cmd": "echo {{trigger.body.host}}"});
    (criteria, parameters)
}

#[tokio::test]
async fn webhook_trigger_runs_shell_command() {
    let dir = TempDir::new().unwrap();
    let ctx = context_in(&dir).await;
    ctx.store
        .register_action("core", "local", RUNNER_LOCAL_SHELL, &json!({}), None)
        .await
        .unwrap();
    let (criteria, parameters) = echo_rule_definition();
    ctx.store
        .add_or_update_rule(
            "examples",
            "r1",
            true,
            "core.st2.webhook",
            &criteria,
            "core.local",
            &parameters,
            &json!({}),
        )
        .await
        .unwrap();
    ctx.spawn_components().await.unwrap();

    ctx.dispatcher
        .dispatch(
            "core.st2.webhook",
            &json!({"headers": {}, "body": {"host": "h1"}}),
            None,
            None,
        )
        .await
        .unwrap();

    let exec = wait_for(10, "execution to succeed", || async {
        executions_for(&ctx, "core.local")
            .await
            .into_iter()
            .find(|e| e.status == "succeeded")
    })
    .await;

    let result = exec.result_value();
    assert_eq!(result["stdout"], "h1\n");
    assert_eq!(result["return_code"], 0);

    // The rule's template rendered against the trigger payload.
    let live = ctx.store.get_live_action(&exec.liveaction_id).await.unwrap();
    assert_eq!(live.parameters_value()["cmd"], "echo h1");
}

#[tokio::test]
async fn criteria_mismatch_leaves_no_trace_of_enforcement() {
    let dir = TempDir::new().unwrap();
    let ctx = context_in(&dir).await;
    ctx.store
        .register_action("core", "local", RUNNER_LOCAL_SHELL, &json!({}), None)
        .await
        .unwrap();
    let (criteria, parameters) = echo_rule_definition();
    ctx.store
        .add_or_update_rule(
            "examples",
            "r1",
            true,
            "core.st2.webhook",
            &criteria,
            "core.local",
            &parameters,
            &json!({}),
        )
        .await
        .unwrap();
    ctx.spawn_components().await.unwrap();

    let instance = ctx
        .dispatcher
        .dispatch("core.st2.webhook", &json!({"body": {"host": "h2"}}), None, None)
        .await
        .unwrap();

    wait_for(10, "instance processed", || async {
        let row = ctx.store.get_trigger_instance(&instance.id).await.unwrap();
        (row.status == "processed").then_some(())
    })
    .await;

    assert!(ctx
        .store
        .list_enforcements_for_instance(&instance.id)
        .await
        .unwrap()
        .is_empty());
    assert!(executions_for(&ctx, "core.local").await.is_empty());
}

#[tokio::test]
async fn concurrency_cap_delays_second_execution() {
    let dir = TempDir::new().unwrap();
    let ctx = context_in(&dir).await;
    let action = ctx
        .store
        .register_action("core", "local", RUNNER_LOCAL_SHELL, &json!({}), None)
        .await
        .unwrap();
    ctx.store
        .add_or_update_policy(
            "examples",
            "one-at-a-time",
            "core.local",
            POLICY_TYPE_CONCURRENCY,
            &json!({"threshold": 1, "action": "delay"}),
        )
        .await
        .unwrap();

    // Scheduler and worker only: the interesting path is admission.
    tokio::spawn(Arc::clone(&ctx.scheduler).run());
    tokio::spawn(Arc::clone(&ctx.scheduler).run_delayed_sweep());
    tokio::spawn(Arc::clone(&ctx.scheduler).run_completion_nudge());
    tokio::spawn(Arc::clone(&ctx.worker).run());

    let submit = |parameters: Value| {
        let ctx = ctx.clone();
        let action = action.clone();
        async move {
            let (live, _) = ctx
                .store
                .create_live_action_pair(&action, &parameters, &json!({}), None, None)
                .await
                .unwrap();
            ctx.bus
                .publish(
                    exchanges::LIVEACTION_STATUS,
                    "requested",
                    serde_json::to_value(&live).unwrap(),
                )
                .await
                .unwrap();
            live.id
        }
    };

    let first = submit(json!({"cmd": "sleep 1"})).await;
    wait_for(10, "first execution running", || async {
        let live = ctx.store.get_live_action(&first).await.unwrap();
        (live.status == "running").then_some(())
    })
    .await;

    // Second goes over the threshold and is parked as delayed.
    let second = submit(json!({"cmd": "true"})).await;
    wait_for(10, "second execution delayed", || async {
        let live = ctx.store.get_live_action(&second).await.unwrap();
        (live.status == "delayed").then_some(())
    })
    .await;

    // Both complete once the first finishes and the sweep requeues.
    for id in [&first, &second] {
        wait_for(20, "both executions succeed", || async {
            let live = ctx.store.get_live_action(id).await.unwrap();
            (live.status == "succeeded").then_some(())
        })
        .await;
    }
    // The delayed one did run eventually.
    let delayed = ctx.store.get_live_action(&second).await.unwrap();
    assert!(delayed.start_timestamp.is_some());
}

#[tokio::test]
async fn async_runner_completes_on_third_poll() {
    let dir = TempDir::new().unwrap();
    let ctx = context_in(&dir).await;
    let action = ctx
        .store
        .register_action("core", "remote-job", RUNNER_MOCK_ASYNC, &json!({}), None)
        .await
        .unwrap();

    tokio::spawn(Arc::clone(&ctx.scheduler).run());
    tokio::spawn(Arc::clone(&ctx.worker).run());
    tokio::spawn(Arc::clone(&ctx.tracker).run());

    let (live, execution) = ctx
        .store
        .create_live_action_pair(
            &action,
            &json!({
                "external_id": "x1",
                "polls_until_done": 3,
                "final_result": {"ok": true},
            }),
            &json!({}),
            None,
            None,
        )
        .await
        .unwrap();
    ctx.bus
        .publish(
            exchanges::LIVEACTION_STATUS,
            "requested",
            serde_json::to_value(&live).unwrap(),
        )
        .await
        .unwrap();

    // The runner hands back control immediately; the execution parks in
    // `running` with a query state until the third poll completes it.
    wait_for(10, "execution running with query state", || async {
        let row = ctx.store.get_live_action(&live.id).await.unwrap();
        (row.status == "running").then_some(())
    })
    .await;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(
        ctx.store.get_live_action(&live.id).await.unwrap().status,
        "running",
        "first poll must not complete the execution"
    );

    wait_for(15, "execution succeeded via tracker", || async {
        let row = ctx.store.get_live_action(&live.id).await.unwrap();
        (row.status == "succeeded").then_some(row)
    })
    .await;
    let exec = ctx.store.get_execution(&execution.id).await.unwrap();
    assert_eq!(exec.status, "succeeded");
    assert_eq!(exec.result_value()["ok"], true);
    // Query state is cleaned up with the completion.
    assert!(ctx
        .store
        .list_states_for_running_executions()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn redelivered_trigger_instance_enforces_once() {
    let dir = TempDir::new().unwrap();
    let ctx = context_in(&dir).await;
    ctx.store
        .register_action("core", "local", RUNNER_LOCAL_SHELL, &json!({}), None)
        .await
        .unwrap();
    let (criteria, parameters) = echo_rule_definition();
    ctx.store
        .add_or_update_rule(
            "examples",
            "r1",
            true,
            "core.st2.webhook",
            &criteria,
            "core.local",
            &parameters,
            &json!({}),
        )
        .await
        .unwrap();
    ctx.spawn_components().await.unwrap();

    let instance = ctx
        .dispatcher
        .dispatch(
            "core.st2.webhook",
            &json!({"headers": {}, "body": {"host": "h1"}}),
            None,
            None,
        )
        .await
        .unwrap();
    // Simulate a broker redelivery of the same instance message.
    ctx.bus
        .publish(
            exchanges::TRIGGER_DISPATCH,
            &instance.trigger_ref,
            serde_json::to_value(&instance).unwrap(),
        )
        .await
        .unwrap();

    wait_for(10, "instance processed", || async {
        let row = ctx.store.get_trigger_instance(&instance.id).await.unwrap();
        (row.status == "processed").then_some(())
    })
    .await;
    // Give the redelivered copy time to be consumed too.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let enforcements = ctx
        .store
        .list_enforcements_for_instance(&instance.id)
        .await
        .unwrap();
    assert_eq!(enforcements.len(), 1);
    assert_eq!(executions_for(&ctx, "core.local").await.len(), 1);
}

#[tokio::test]
async fn cancel_while_scheduled_never_runs() {
    let dir = TempDir::new().unwrap();
    let ctx = context_in(&dir).await;
    let action = ctx
        .store
        .register_action("core", "local", RUNNER_LOCAL_SHELL, &json!({}), None)
        .await
        .unwrap();

    // Scheduler without a worker: the execution parks in `scheduled`.
    tokio::spawn(Arc::clone(&ctx.scheduler).run());

    let (live, _) = ctx
        .store
        .create_live_action_pair(&action, &json!({"cmd": "true"}), &json!({}), None, None)
        .await
        .unwrap();
    ctx.bus
        .publish(
            exchanges::LIVEACTION_STATUS,
            "requested",
            serde_json::to_value(&live).unwrap(),
        )
        .await
        .unwrap();

    wait_for(10, "execution scheduled", || async {
        let row = ctx.store.get_live_action(&live.id).await.unwrap();
        (row.status == "scheduled").then_some(())
    })
    .await;

    ctx.cancel_service.cancel(&live.id).await.unwrap();

    let done = ctx.store.get_live_action(&live.id).await.unwrap();
    assert_eq!(done.status_enum(), Some(ExecutionStatus::Canceled));
    // The runner was never invoked.
    assert!(done.start_timestamp.is_none());
    assert!(done.end_timestamp.is_some());
    let exec = ctx.store.get_execution_for_liveaction(&live.id).await.unwrap();
    assert_eq!(exec.status, "canceled");
}
