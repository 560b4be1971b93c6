use async_trait::async_trait;
use axum::Router;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::container::{ServiceInstance, ServiceRef};
use crate::context::{ModuleCtx, RegisterCtx};
use crate::descriptor::ModuleDescriptor;

/// Stage 1: synchronous, local registration. No I/O, no other modules.
pub trait Module: Send + Sync + 'static {
    fn register(&self, ctx: &mut RegisterCtx<'_>) -> anyhow::Result<()>;
}

/// Stage 2: async initialization, driven by the post-init hook scheduler.
#[async_trait]
pub trait InitModule: Send + Sync {
    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait StatefulModule: Send + Sync {
    /// Graceful stop. `cancel` fires when the handler's timeout elapses.
    async fn stop(&self, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Forced stop. Runs on a dedicated thread; must not block indefinitely.
    fn force_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Entry point the engine discovers: a descriptor plus a way to build the module.
pub trait ModuleFactory: Send + Sync + 'static {
    fn descriptor(&self) -> ModuleDescriptor;

    /// Pure wiring; must be sync. Called only for modules declaring an API surface.
    fn register_rest(&self, _ctx: &ModuleCtx, router: Router) -> anyhow::Result<Router> {
        Ok(router)
    }

    fn create(&self, deps: Injected) -> anyhow::Result<ModuleInstance>;
}

/// Everything resolved for a module by the injection step.
#[derive(Clone)]
pub struct Injected {
    pub config: Option<serde_json::Value>,
    pub services: BTreeMap<String, ServiceRef>,
    pub databases: Vec<String>,
    pub ctx: ModuleCtx,
}

impl Injected {
    /// Handle to an injected service; errors when the descriptor did not declare it.
    pub fn service(&self, name: &str) -> anyhow::Result<ServiceRef> {
        self.services.get(name).cloned().ok_or_else(|| {
            anyhow::anyhow!(
                "service '{name}' was not declared for injection in '{}'",
                self.ctx.current_module().unwrap_or("?")
            )
        })
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.databases.iter().any(|d| d == name)
    }

    pub fn config<T: serde::de::DeserializeOwned + Default>(&self) -> T {
        self.config
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// A created module together with the capability implementations it provides.
pub struct ModuleInstance {
    pub(crate) core: Arc<dyn Module>,
    pub(crate) init: Option<Arc<dyn InitModule>>,
    pub(crate) health: Option<Arc<dyn HealthCheck>>,
    pub(crate) stateful: Option<Arc<dyn StatefulModule>>,
    pub(crate) services: Vec<ServiceInstance>,
}

impl ModuleInstance {
    pub fn new(core: Arc<dyn Module>) -> Self {
        Self {
            core,
            init: None,
            health: None,
            stateful: None,
            services: Vec::new(),
        }
    }

    pub fn with_init(mut self, init: Arc<dyn InitModule>) -> Self {
        self.init = Some(init);
        self
    }

    pub fn with_health(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_stateful(mut self, stateful: Arc<dyn StatefulModule>) -> Self {
        self.stateful = Some(stateful);
        self
    }

    /// Provide the implementation for a declared service.
    pub fn with_service<T>(mut self, name: impl Into<String>, instance: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.services.push(ServiceInstance::new(name, instance));
        self
    }

    pub fn core(&self) -> &Arc<dyn Module> {
        &self.core
    }
}
