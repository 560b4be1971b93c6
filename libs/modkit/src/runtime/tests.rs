//! Tests for the runner: bootstrap gating and the shutdown strategies.

use super::{run, RunOptions, ShutdownOptions};
use crate::bootstrap::BootstrapHandler;
use crate::context::RegisterCtx;
use crate::contracts::{Injected, Module, ModuleFactory, ModuleInstance, StatefulModule};
use crate::descriptor::ModuleDescriptor;
use crate::engine::StartupReport;
use crate::shutdown::HandlerOutcome;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Probe {
    created: AtomicBool,
    stops: AtomicUsize,
}

struct Worker(Arc<Probe>);

impl Module for Worker {
    fn register(&self, _ctx: &mut RegisterCtx<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl StatefulModule for Worker {
    async fn stop(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        self.0.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct WorkerFactory(Arc<Probe>);

impl ModuleFactory for WorkerFactory {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("test.worker")
            .name("Worker")
            .version("0.1.0")
            .graceful_shutdown(100, Some(Duration::from_secs(1)))
    }

    fn create(&self, _deps: Injected) -> anyhow::Result<ModuleInstance> {
        self.0.created.store(true, Ordering::SeqCst);
        let worker = Arc::new(Worker(self.0.clone()));
        Ok(ModuleInstance::new(worker.clone()).with_stateful(worker))
    }
}

struct Refuse;

#[async_trait]
impl BootstrapHandler for Refuse {
    fn name(&self) -> &str {
        "refuse"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn should_run(&self) -> bool {
        true
    }

    async fn execute(&self) -> anyhow::Result<bool> {
        Ok(false)
    }
}

fn options(probe: &Arc<Probe>, shutdown: ShutdownOptions) -> RunOptions {
    let mut opts = RunOptions::new(Arc::new(BTreeMap::<String, serde_json::Value>::new()));
    opts.modules.push(Arc::new(WorkerFactory(probe.clone())));
    opts.shutdown = shutdown;
    opts
}

#[tokio::test]
async fn token_cancelled_after_start_stops_modules() {
    let probe = Arc::new(Probe::default());
    let cancel = CancellationToken::new();
    let mut opts = options(&probe, ShutdownOptions::Token(cancel.clone()));

    let started = Arc::new(AtomicBool::new(false));
    let flag = started.clone();
    opts.on_started = Some(Box::new(move |report: &StartupReport| {
        assert_eq!(report.ready, vec!["test.worker".to_string()]);
        flag.store(true, Ordering::SeqCst);
        cancel.cancel();
    }));

    let report = tokio::time::timeout(Duration::from_secs(2), run(opts))
        .await
        .expect("runner should exit once cancelled")
        .unwrap();

    assert!(started.load(Ordering::SeqCst));
    assert_eq!(probe.stops.load(Ordering::SeqCst), 1);
    assert_eq!(report.graceful.len(), 1);
    assert_eq!(report.graceful[0].outcome, HandlerOutcome::Completed);
}

#[tokio::test]
async fn future_completion_triggers_shutdown() {
    let probe = Arc::new(Probe::default());
    let waiter = Box::pin(async {
        tokio::time::sleep(Duration::from_millis(20)).await;
    });
    let opts = options(&probe, ShutdownOptions::Future(waiter));

    let report = tokio::time::timeout(Duration::from_secs(2), run(opts))
        .await
        .expect("runner should exit when the future completes")
        .unwrap();

    assert!(report.all_completed());
    assert_eq!(probe.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_bootstrap_never_creates_modules() {
    let probe = Arc::new(Probe::default());
    let mut opts = options(&probe, ShutdownOptions::Token(CancellationToken::new()));
    opts.bootstrap.register(Refuse);

    let err = run(opts).await.unwrap_err();

    assert!(err.to_string().contains("refuse"));
    assert!(!probe.created.load(Ordering::SeqCst));
}
