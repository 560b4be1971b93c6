//! Configurable test module shared by the engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{routing::get, Router};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use modkit::{
    HealthCheck, InitModule, Injected, Module, ModuleCtx, ModuleDescriptor, ModuleFactory,
    ModuleInstance, RegisterCtx, StatefulModule,
};

pub type CallTracker = Arc<Mutex<Vec<String>>>;

pub fn tracker() -> CallTracker {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(t: &CallTracker) -> Vec<String> {
    t.lock().unwrap().clone()
}

pub trait Greeter: Send + Sync {
    fn greet(&self) -> String;
}

struct Echo(String);

impl Greeter for Echo {
    fn greet(&self) -> String {
        format!("hello from {}", self.0)
    }
}

#[derive(Clone, Default)]
pub struct Faults {
    pub register: bool,
    pub init: bool,
    pub create: bool,
    pub health: bool,
    pub stop: bool,
}

/// A module whose every lifecycle call is appended to a shared tracker
/// as `"<call>:<module id>"`.
pub struct TestFactory {
    descriptor: ModuleDescriptor,
    calls: CallTracker,
    faults: Faults,
    injected: Arc<Mutex<Option<Injected>>>,
}

impl TestFactory {
    pub fn new(descriptor: ModuleDescriptor, calls: &CallTracker) -> Self {
        let descriptor = if descriptor.name.is_empty() {
            let name = descriptor.id.clone();
            descriptor.name(name)
        } else {
            descriptor
        };
        let descriptor = if descriptor.version.is_empty() {
            descriptor.version("1.0.0")
        } else {
            descriptor
        };
        Self::raw(descriptor, calls)
    }

    /// Keeps the descriptor exactly as given.
    pub fn raw(descriptor: ModuleDescriptor, calls: &CallTracker) -> Self {
        Self {
            descriptor,
            calls: calls.clone(),
            faults: Faults::default(),
            injected: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// Handle to whatever the injection step handed to `create`.
    pub fn injected(&self) -> Arc<Mutex<Option<Injected>>> {
        self.injected.clone()
    }
}

impl ModuleFactory for TestFactory {
    fn descriptor(&self) -> ModuleDescriptor {
        self.descriptor.clone()
    }

    fn register_rest(&self, ctx: &ModuleCtx, router: Router) -> anyhow::Result<Router> {
        let id = ctx.current_module().unwrap_or_default().to_string();
        self.calls.lock().unwrap().push(format!("rest:{id}"));
        Ok(router.route("/ping", get(|| async { "pong" })))
    }

    fn create(&self, deps: Injected) -> anyhow::Result<ModuleInstance> {
        if self.faults.create {
            anyhow::bail!("create refused");
        }
        let id = self.descriptor.id.clone();
        *self.injected.lock().unwrap() = Some(deps);

        let module = Arc::new(TestModule {
            id: id.clone(),
            calls: self.calls.clone(),
            faults: self.faults.clone(),
        });
        let mut instance = ModuleInstance::new(module.clone());
        if self.descriptor.has_stage2() {
            instance = instance.with_init(module.clone());
        }
        if self.descriptor.capabilities.health_check {
            instance = instance.with_health(module.clone());
        }
        if self.descriptor.has_shutdown() {
            instance = instance.with_stateful(module.clone());
        }
        for svc in &self.descriptor.capabilities.services {
            let greeter: Arc<dyn Greeter> = Arc::new(Echo(id.clone()));
            instance = instance.with_service(svc.name.clone(), greeter);
        }
        Ok(instance)
    }
}

struct TestModule {
    id: String,
    calls: CallTracker,
    faults: Faults,
}

impl TestModule {
    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(format!("{call}:{}", self.id));
    }
}

impl Module for TestModule {
    fn register(&self, _ctx: &mut RegisterCtx<'_>) -> anyhow::Result<()> {
        self.record("register");
        if self.faults.register {
            anyhow::bail!("register refused");
        }
        Ok(())
    }
}

#[async_trait]
impl InitModule for TestModule {
    async fn init(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        self.record("init");
        if self.faults.init {
            anyhow::bail!("init refused");
        }
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for TestModule {
    async fn check(&self) -> anyhow::Result<()> {
        if self.faults.health {
            anyhow::bail!("unhealthy");
        }
        Ok(())
    }
}

#[async_trait]
impl StatefulModule for TestModule {
    async fn stop(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        self.record("stop");
        if self.faults.stop {
            anyhow::bail!("stop refused");
        }
        Ok(())
    }

    fn force_stop(&self) -> anyhow::Result<()> {
        self.record("force");
        Ok(())
    }
}
