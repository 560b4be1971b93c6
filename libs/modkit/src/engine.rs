//! Lifecycle engine: resolve → register → stage 1 → stage 2 → shutdown.
//!
//! The engine is a single-owner state machine; every phase takes `&mut self`
//! and the phases must be driven in order. Bootstrap runs before an engine
//! exists (see [`crate::bootstrap`]).

use axum::Router;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::container::ServiceContainer;
use crate::context::{ConfigProvider, ConfigRegistry, ModuleCtx, ModuleCtxBuilder, SchemaRegistry};
use crate::contracts::ModuleFactory;
use crate::descriptor::DependencyPolicy;
use crate::health::{run_checks, HealthStatus, DEFAULT_HEALTH_TIMEOUT};
use crate::hooks::HookReport;
use crate::pipeline::{RegistrationPipeline, Wiring};
use crate::registry::{ModuleRegistry, RegistryBuilder, RegistryError};
use crate::resolver::{DependencyResolver, MissingDependency, ResolveError};
use crate::shutdown::{ShutdownOrchestrator, ShutdownReport, DEFAULT_FORCE_TIMEOUT, DEFAULT_GRACEFUL_TIMEOUT};
use crate::stage::StageExecutor;
use crate::status::{FailurePhase, ModuleFailure, ModuleStatus};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub dependency_policy: DependencyPolicy,
    /// Host runs against mock data; modules with `no_mock_data` refuse to load.
    pub mock_mode: bool,
    /// Graceful shutdown timeout for handlers that declare none.
    pub default_shutdown_timeout: Duration,
    /// Forced shutdown timeout for handlers that declare none.
    pub default_force_timeout: Duration,
    pub health_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dependency_policy: DependencyPolicy::Lenient,
            mock_mode: false,
            default_shutdown_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            default_force_timeout: DEFAULT_FORCE_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Created,
    Prepared,
    Registered,
    Started,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("engine is {actual:?}; this operation needs {expected:?}")]
    InvalidPhase {
        expected: EnginePhase,
        actual: EnginePhase,
    },
}

#[derive(Debug, Clone)]
pub struct StartupReport {
    pub order: Vec<String>,
    pub ready: Vec<String>,
    pub failed: Vec<(String, ModuleFailure)>,
    pub missing: Vec<MissingDependency>,
    pub hooks: HookReport,
    /// Routes of every module with an API surface, nested under their prefixes.
    pub router: Router,
}

pub struct EngineBuilder {
    options: EngineOptions,
    modules: RegistryBuilder,
    config: Option<Arc<dyn ConfigProvider>>,
    schemas: Option<Arc<dyn ConfigRegistry>>,
    container: Option<Arc<ServiceContainer>>,
    cancel: Option<CancellationToken>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            options: EngineOptions::default(),
            modules: RegistryBuilder::default(),
            config: None,
            schemas: None,
            container: None,
            cancel: None,
        }
    }
}

impl EngineBuilder {
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_config_provider(mut self, config: Arc<dyn ConfigProvider>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_config_registry(mut self, schemas: Arc<dyn ConfigRegistry>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn with_container(mut self, container: Arc<ServiceContainer>) -> Self {
        self.container = Some(container);
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn module<F: ModuleFactory>(mut self, factory: F) -> Self {
        self.modules.register(factory);
        self
    }

    pub fn module_arc(mut self, factory: Arc<dyn ModuleFactory>) -> Self {
        self.modules.register_arc(factory);
        self
    }

    /// Discovers all registered factories. Duplicate module ids are fatal.
    pub fn build(self) -> Result<Engine, EngineError> {
        let config: Arc<dyn ConfigProvider> = self
            .config
            .unwrap_or_else(|| Arc::new(BTreeMap::<String, serde_json::Value>::new()));
        let schemas: Arc<dyn ConfigRegistry> =
            self.schemas.unwrap_or_else(|| Arc::new(SchemaRegistry::new()));
        let container = self.container.unwrap_or_default();
        let cancel = self.cancel.unwrap_or_default();

        tracing::info!("Phase: discovery");
        let registry = self.modules.build(config.as_ref())?;

        let base_ctx = ModuleCtxBuilder::new(cancel.clone())
            .with_config_provider(config.clone())
            .with_services(container.clone())
            .with_mock_mode(self.options.mock_mode)
            .build();

        Ok(Engine {
            options: self.options,
            registry,
            container,
            config,
            schemas,
            base_ctx,
            cancel,
            phase: EnginePhase::Created,
            order: Vec::new(),
            missing: Vec::new(),
            wiring: Wiring::new(),
        })
    }
}

pub struct Engine {
    options: EngineOptions,
    registry: ModuleRegistry,
    container: Arc<ServiceContainer>,
    config: Arc<dyn ConfigProvider>,
    schemas: Arc<dyn ConfigRegistry>,
    base_ctx: ModuleCtx,
    cancel: CancellationToken,
    phase: EnginePhase,
    order: Vec<String>,
    missing: Vec<MissingDependency>,
    wiring: Wiring,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn container(&self) -> &Arc<ServiceContainer> {
        &self.container
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Load order computed by [`Engine::prepare`].
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn status(&self, module_id: &str) -> Option<ModuleStatus> {
        self.registry.status(module_id)
    }

    /// The composed API router; each module's routes are nested under its prefix.
    pub fn router(&self) -> Router {
        self.wiring.router.clone()
    }

    fn expect_phase(&self, expected: EnginePhase) -> Result<(), EngineError> {
        if self.phase != expected {
            return Err(EngineError::InvalidPhase {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }

    /// Runs every phase up to and including Stage 2.
    pub async fn start(&mut self) -> Result<StartupReport, EngineError> {
        self.prepare()?;
        self.run_stage1()?;
        let hooks = self.run_stage2().await?;

        let report = StartupReport {
            order: self.order.clone(),
            ready: self
                .order
                .iter()
                .filter(|id| self.registry.status(id) == Some(ModuleStatus::Ready))
                .cloned()
                .collect(),
            failed: self.registry.failed(),
            missing: self.missing.clone(),
            hooks,
            router: self.wiring.router.clone(),
        };
        tracing::info!(
            order = ?report.order,
            ready = report.ready.len(),
            failed = report.failed.len(),
            "Startup complete"
        );
        for (id, failure) in &report.failed {
            tracing::warn!(module = %id, reason = %failure, "Module is not running");
        }
        Ok(report)
    }

    /// Resolve the load order and run the registration pipeline for every module.
    pub fn prepare(&mut self) -> Result<&[String], EngineError> {
        self.expect_phase(EnginePhase::Created)?;

        tracing::info!("Phase: resolve");
        let resolution = DependencyResolver::new(self.options.dependency_policy)
            .resolve(&self.registry.descriptors())?;

        for m in resolution.strict_failures() {
            if let Some(entry) = self.registry.get(&m.module) {
                entry.fail(
                    FailurePhase::Resolve,
                    format!("required dependency '{}' is not registered", m.depends_on),
                );
            }
        }

        tracing::info!("Phase: register");
        let mut pipeline = RegistrationPipeline {
            options: &self.options,
            registry: &self.registry,
            graph: &resolution.graph,
            container: &self.container,
            config: &self.config,
            schemas: self.schemas.as_ref(),
            base_ctx: &self.base_ctx,
            wiring: &mut self.wiring,
        };
        for (load_index, id) in resolution.order.iter().enumerate() {
            let Some(entry) = self.registry.get(id) else {
                continue;
            };
            if entry.status() == ModuleStatus::Failed {
                continue;
            }
            if let Err(e) = pipeline.process(entry, load_index) {
                entry.fail(FailurePhase::Pipeline(e.step), format!("{:#}", e.source));
            }
        }

        self.order = resolution.order;
        self.missing = resolution.missing;
        self.phase = EnginePhase::Prepared;
        Ok(&self.order)
    }

    /// Stage 1 for every module that passed registration.
    pub fn run_stage1(&mut self) -> Result<Vec<String>, EngineError> {
        self.expect_phase(EnginePhase::Prepared)?;
        let registered = self.executor().run_stage1(&self.order);
        self.phase = EnginePhase::Registered;
        Ok(registered)
    }

    pub async fn run_stage2(&mut self) -> Result<HookReport, EngineError> {
        self.expect_phase(EnginePhase::Registered)?;
        let hooks = std::mem::take(&mut self.wiring.hooks);
        let report = self.executor().run_stage2(hooks).await;
        self.phase = EnginePhase::Started;
        Ok(report)
    }

    fn executor(&self) -> StageExecutor<'_> {
        StageExecutor {
            registry: &self.registry,
            wiring: &self.wiring,
            container: &self.container,
            config: self.config.as_ref(),
            schemas: self.schemas.as_ref(),
            policy: self.options.dependency_policy,
        }
    }

    /// Runs every declared health check; modules that are not ready report unhealthy.
    pub async fn health_report(&self) -> BTreeMap<String, HealthStatus> {
        let mut report = run_checks(&self.wiring.health, self.options.health_timeout).await;
        for (id, status) in report.iter_mut() {
            match self.registry.status(id) {
                Some(ModuleStatus::Ready) | None => {}
                Some(other) => *status = HealthStatus::Unhealthy(format!("module is {other}")),
            }
        }
        report
    }

    /// Graceful pass, then forced pass, then container teardown. Idempotent.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        if self.phase == EnginePhase::Stopped {
            return ShutdownReport::default();
        }
        tracing::info!("Phase: stop");

        let stoppable: Vec<&str> = self
            .registry
            .entries()
            .iter()
            .filter(|e| {
                e.status().is_live()
                    || e.failure().is_some_and(|f| f.phase == FailurePhase::Stage2)
            })
            .map(|e| e.id())
            .collect();

        let mut orchestrator = ShutdownOrchestrator::new();
        for handler in std::mem::take(&mut self.wiring.shutdown) {
            if stoppable.contains(&handler.module_id()) {
                orchestrator.register(handler);
            }
        }

        self.advance(ModuleStatus::ShuttingDownGraceful);
        let graceful = orchestrator.run_graceful(&CancellationToken::new()).await;
        self.advance(ModuleStatus::ShuttingDownForced);
        let forced = orchestrator.run_forced().await;
        self.advance(ModuleStatus::Stopped);

        self.container.clear();
        self.wiring.health.clear();
        self.phase = EnginePhase::Stopped;

        let report = ShutdownReport { graceful, forced };
        tracing::info!(clean = report.all_completed(), "Shutdown complete");
        report
    }

    fn advance(&self, to: ModuleStatus) {
        for e in self.registry.entries() {
            if e.status().can_transition_to(to) {
                let _ = e.transition(to);
            }
        }
    }
}
