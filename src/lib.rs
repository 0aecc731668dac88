pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod gc;
pub mod keyvalue;
pub mod models;
pub mod notifier;
pub mod policies;
pub mod registry;
pub mod rules;
pub mod runners;
pub mod scheduler;
pub mod store;
pub mod template;
pub mod tracker;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::info;

use bus::MessageBus;
use config::DaemonConfig;
use dispatcher::TriggerDispatcher;
use gc::GarbageCollector;
use keyvalue::{Crypto, KeyValueService};
use notifier::Notifier;
use policies::PolicyEngine;
use registry::ServiceRegistry;
use rules::{RuleCache, RulesEngine};
use runners::RunnerRegistry;
use scheduler::Scheduler;
use store::Store;
use tracker::{QuerierRegistry, ResultsTracker};
use worker::{ActionWorker, CancelRegistry, CancelService};

/// Shared application state passed to every background component.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub store: Arc<Store>,
    pub bus: Arc<MessageBus>,
    pub dispatcher: Arc<TriggerDispatcher>,
    pub rules_engine: Arc<RulesEngine>,
    pub rule_cache: Arc<RuleCache>,
    pub scheduler: Arc<Scheduler>,
    pub worker: Arc<ActionWorker>,
    pub cancels: Arc<CancelRegistry>,
    pub cancel_service: Arc<CancelService>,
    pub tracker: Arc<ResultsTracker>,
    pub notifier: Arc<Notifier>,
    pub gc: Arc<GarbageCollector>,
    pub service_registry: Arc<ServiceRegistry>,
}

impl AppContext {
    /// Construct every component against one store and one bus. Nothing is
    /// spawned; call [`AppContext::spawn_components`] to start the daemon
    /// loops, or drive components directly in tests.
    pub async fn init(config: DaemonConfig) -> Result<Self> {
        let config = Arc::new(config);
        let store = Arc::new(
            Store::new_with_slow_query(&config.database.data_dir, config.database.slow_query_ms)
                .await
                .context("open store")?,
        );
        let bus = Arc::new(MessageBus::with_capacity(
            &config.messaging.prefix,
            config.messaging.queue_capacity,
        ));
        store.bind_bus(Arc::clone(&bus)).await;

        let crypto = match &config.keyvalue.encryption_key_path {
            Some(path) => Some(Crypto::from_key_file(path).context("load kv encryption key")?),
            None => None,
        };
        let kv = KeyValueService::new(Arc::clone(&store), crypto);

        let policies = PolicyEngine::new(Arc::clone(&store));
        let dispatcher = TriggerDispatcher::new(Arc::clone(&store), Arc::clone(&bus));
        let rule_cache = RuleCache::new(Arc::clone(&store));
        let rules_engine = RulesEngine::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&rule_cache),
            kv,
        );
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&policies),
            config.scheduler.clone(),
        );
        let cancels = CancelRegistry::new();
        let worker = ActionWorker::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::new(RunnerRegistry::builtin()),
            Arc::clone(&policies),
            Arc::clone(&cancels),
            config.actionrunner.clone(),
        );
        let cancel_service = CancelService::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&cancels),
        );
        let tracker = ResultsTracker::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::new(QuerierRegistry::builtin()),
            config.resultstracker.clone(),
        );
        let notifier = Notifier::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&dispatcher),
            config.notifier.clone(),
        );
        let gc = GarbageCollector::new(Arc::clone(&store), config.garbagecollector.clone());
        let service_registry = ServiceRegistry::new(config.registry.clone());

        let ctx = Self {
            config,
            store,
            bus,
            dispatcher,
            rules_engine,
            rule_cache,
            scheduler,
            worker,
            cancels,
            cancel_service,
            tracker,
            notifier,
            gc,
            service_registry,
        };
        ctx.bootstrap().await?;
        Ok(ctx)
    }

    /// Idempotent seed data: built-in trigger types and runner types.
    async fn bootstrap(&self) -> Result<()> {
        for (name, payload_schema) in [
            ("st2.webhook", serde_json::json!({"type": "object"})),
            ("st2.generic.actiontrigger", serde_json::json!({})),
            ("st2.generic.notifytrigger", serde_json::json!({})),
        ] {
            self.store
                .add_or_update_trigger_type("core", name, &serde_json::json!({}), &payload_schema)
                .await
                .with_context(|| format!("register trigger type core.{name}"))?;
        }
        for name in [
            runners::RUNNER_LOCAL_SHELL,
            runners::RUNNER_HTTP,
            runners::RUNNER_NOOP,
            runners::RUNNER_MOCK_ASYNC,
        ] {
            self.store
                .register_runner_type(name, name, &serde_json::json!({}))
                .await
                .with_context(|| format!("register runner type {name}"))?;
        }
        Ok(())
    }

    /// Spawn every background loop. Recovery of stuck `scheduled` executions
    /// runs first so replays land on the queue before consumers start racing.
    pub async fn spawn_components(&self) -> Result<()> {
        self.scheduler
            .recover_stuck_scheduled()
            .await
            .context("recover stuck executions")?;

        for (group, member, tags) in [
            ("rules-engine", "rules-engine-1", vec!["criteria"]),
            ("scheduler", "scheduler-1", vec!["delayed-sweep"]),
            ("actionrunner", "actionrunner-1", vec![]),
            ("resultstracker", "resultstracker-1", vec![]),
            ("notifier", "notifier-1", vec![]),
            ("garbagecollector", "garbagecollector-1", vec![]),
        ] {
            self.service_registry.register(group, member, &tags);
        }

        let _ = self.rule_cache.spawn_invalidator(Arc::clone(&self.bus));
        tokio::spawn(Arc::clone(&self.rules_engine).run());
        tokio::spawn(Arc::clone(&self.scheduler).run());
        tokio::spawn(Arc::clone(&self.scheduler).run_delayed_sweep());
        tokio::spawn(Arc::clone(&self.scheduler).run_completion_nudge());
        tokio::spawn(Arc::clone(&self.worker).run());
        tokio::spawn(Arc::clone(&self.tracker).run());
        tokio::spawn(Arc::clone(&self.notifier).run());
        tokio::spawn(Arc::clone(&self.dispatcher).run_pending_sweep());
        tokio::spawn(Arc::clone(&self.gc).run());
        tokio::spawn(Arc::clone(&self.service_registry).run_expiry_sweep());

        info!("all components running");
        Ok(())
    }
}
