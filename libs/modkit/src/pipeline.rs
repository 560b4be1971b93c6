//! Fourteen-step registration pipeline.
//!
//! Each module goes through the steps in a fixed order. Steps 1-13 only
//! validate and stage; nothing becomes visible to other modules until step 14
//! commits the staged records in one go. A failing step fails only the module
//! being processed.

use anyhow::{anyhow, bail, Context};
use axum::Router;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::container::{ServiceContainer, ServiceOwner, ServiceRef};
use crate::context::{ConfigProvider, ConfigRegistry, ModuleCtx};
use crate::contracts::{HealthCheck, Injected, Module, ModuleInstance};
use crate::descriptor::{
    DependencyPolicy, InjectTarget, ModuleDescriptor, ServiceSpec, Stage2Spec,
};
use crate::engine::EngineOptions;
use crate::graph::DependencyGraph;
use crate::hooks::{panic_message, PostInitHook};
use crate::registry::{ModuleEntry, ModuleRegistry};
use crate::shutdown::{ShutdownHandler, ShutdownKind};
use crate::status::ModuleStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStep {
    Validate,
    Integrity,
    Dependencies,
    Services,
    Config,
    Database,
    Api,
    HealthCheck,
    Shutdown,
    Injection,
    Stage1Entry,
    Stage2Entry,
    Instantiate,
    Finalize,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 14] = [
        PipelineStep::Validate,
        PipelineStep::Integrity,
        PipelineStep::Dependencies,
        PipelineStep::Services,
        PipelineStep::Config,
        PipelineStep::Database,
        PipelineStep::Api,
        PipelineStep::HealthCheck,
        PipelineStep::Shutdown,
        PipelineStep::Injection,
        PipelineStep::Stage1Entry,
        PipelineStep::Stage2Entry,
        PipelineStep::Instantiate,
        PipelineStep::Finalize,
    ];

    /// 1-based position in the pipeline.
    pub const fn number(self) -> u8 {
        self as u8 + 1
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            PipelineStep::Validate => "validate",
            PipelineStep::Integrity => "integrity",
            PipelineStep::Dependencies => "dependencies",
            PipelineStep::Services => "services",
            PipelineStep::Config => "config",
            PipelineStep::Database => "database",
            PipelineStep::Api => "api",
            PipelineStep::HealthCheck => "health_check",
            PipelineStep::Shutdown => "shutdown",
            PipelineStep::Injection => "injection",
            PipelineStep::Stage1Entry => "stage1_entry",
            PipelineStep::Stage2Entry => "stage2_entry",
            PipelineStep::Instantiate => "instantiate",
            PipelineStep::Finalize => "finalize",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("registration of '{module}' failed at step {} ({})", .step.number(), .step.as_str())]
pub struct PipelineStepError {
    pub module: String,
    pub step: PipelineStep,
    #[source]
    pub source: anyhow::Error,
}

/// A module that made it through step 14.
pub(crate) struct WiredModule {
    pub core: Arc<dyn Module>,
    pub stage1_entry: String,
    /// Declared dependencies that were actually available.
    pub dependencies: Vec<String>,
    pub has_hook: bool,
}

/// Everything committed by step 14, across all modules.
pub(crate) struct Wiring {
    pub modules: HashMap<String, WiredModule>,
    pub hooks: Vec<PostInitHook>,
    pub shutdown: Vec<ShutdownHandler>,
    pub health: Vec<(String, Arc<dyn HealthCheck>)>,
    pub databases: BTreeMap<String, BTreeSet<String>>,
    pub apis: BTreeMap<String, String>,
    pub router: Router,
}

impl Wiring {
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
            hooks: Vec::new(),
            shutdown: Vec::new(),
            health: Vec::new(),
            databases: BTreeMap::new(),
            apis: BTreeMap::new(),
            router: Router::new(),
        }
    }
}

/// Per-module records held back until step 14.
struct Staged {
    ctx: ModuleCtx,
    dependencies: Vec<String>,
    services: Vec<ServiceSpec>,
    database: Option<String>,
    router: Option<(String, Router)>,
    health: bool,
    shutdown: Vec<(ShutdownKind, i32, Duration)>,
    injected: Option<Injected>,
    stage1_entry: String,
    hook: Option<Stage2Spec>,
    instance: Option<ModuleInstance>,
}

impl Staged {
    fn new(ctx: ModuleCtx) -> Self {
        Self {
            ctx,
            dependencies: Vec::new(),
            services: Vec::new(),
            database: None,
            router: None,
            health: false,
            shutdown: Vec::new(),
            injected: None,
            stage1_entry: String::new(),
            hook: None,
            instance: None,
        }
    }
}

pub(crate) struct RegistrationPipeline<'a> {
    pub options: &'a EngineOptions,
    pub registry: &'a ModuleRegistry,
    pub graph: &'a DependencyGraph,
    pub container: &'a Arc<ServiceContainer>,
    pub config: &'a Arc<dyn ConfigProvider>,
    pub schemas: &'a dyn ConfigRegistry,
    pub base_ctx: &'a ModuleCtx,
    pub wiring: &'a mut Wiring,
}

impl RegistrationPipeline<'_> {
    /// Runs all steps for one module. `load_index` is its position in load order.
    pub fn process(&mut self, entry: &ModuleEntry, load_index: usize) -> Result<(), PipelineStepError> {
        let d = entry.descriptor();
        let mut staged = Staged::new(self.base_ctx.clone().for_module(&d.id));

        for step in PipelineStep::ALL {
            self.run_step(step, entry, load_index, &mut staged)
                .map_err(|source| PipelineStepError {
                    module: d.id.clone(),
                    step,
                    source,
                })?;
        }
        tracing::debug!(module = %d.id, "Registration pipeline complete");
        Ok(())
    }

    fn run_step(
        &mut self,
        step: PipelineStep,
        entry: &ModuleEntry,
        load_index: usize,
        staged: &mut Staged,
    ) -> anyhow::Result<()> {
        let d = entry.descriptor();
        match step {
            PipelineStep::Validate => Ok(d.validate()?),
            PipelineStep::Integrity => self.check_integrity(d),
            PipelineStep::Dependencies => self.check_dependencies(d, staged),
            PipelineStep::Services => {
                for svc in &d.capabilities.services {
                    if let Some(owner) = self.container.owner_of(&svc.name) {
                        bail!("service '{}' is already registered by {owner}", svc.name);
                    }
                }
                staged.services = d.capabilities.services.clone();
                Ok(())
            }
            PipelineStep::Config => {
                if let Some(schema) = &d.config_schema {
                    self.schemas
                        .register_schema(&d.id, schema)
                        .context("config schema rejected")?;
                }
                Ok(())
            }
            PipelineStep::Database => {
                staged.database = d.capabilities.database.clone();
                Ok(())
            }
            PipelineStep::Api => {
                if let Some(api) = &d.capabilities.api {
                    if let Some(owner) = self.wiring.apis.get(&api.prefix) {
                        bail!("api prefix '{}' is already mounted by '{owner}'", api.prefix);
                    }
                    let router = entry
                        .factory()
                        .register_rest(&staged.ctx, Router::new())
                        .context("REST registration failed")?;
                    staged.router = Some((api.prefix.clone(), router));
                }
                Ok(())
            }
            PipelineStep::HealthCheck => {
                staged.health = d.capabilities.health_check;
                Ok(())
            }
            PipelineStep::Shutdown => {
                if let Some(s) = d.shutdown {
                    let timeout = s.timeout.unwrap_or(self.options.default_shutdown_timeout);
                    staged.shutdown.push((ShutdownKind::Graceful, s.priority, timeout));
                }
                if let Some(s) = d.force_shutdown {
                    let timeout = s.timeout.unwrap_or(self.options.default_force_timeout);
                    staged.shutdown.push((ShutdownKind::Forced, s.priority, timeout));
                }
                Ok(())
            }
            PipelineStep::Injection => {
                staged.injected = Some(self.resolve_injection(d, staged)?);
                Ok(())
            }
            PipelineStep::Stage1Entry => {
                staged.stage1_entry = d.stage1_entry.clone();
                Ok(())
            }
            PipelineStep::Stage2Entry => {
                if let Some(spec) = &d.stage2 {
                    if self.wiring.hooks.iter().any(|h| h.name() == spec.hook) {
                        bail!("post-init hook '{}' is already registered", spec.hook);
                    }
                    staged.hook = Some(spec.clone());
                }
                Ok(())
            }
            PipelineStep::Instantiate => {
                let injected = staged
                    .injected
                    .take()
                    .ok_or_else(|| anyhow!("injection step produced nothing"))?;
                let instance = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    entry.factory().create(injected)
                }))
                .map_err(|p| anyhow!("module factory panicked: {}", panic_message(p.as_ref())))?
                .context("module factory failed")?;
                verify_instance(d, &instance)?;
                staged.instance = Some(instance);
                Ok(())
            }
            PipelineStep::Finalize => self.commit(entry, load_index, staged),
        }
    }

    fn check_integrity(&self, d: &ModuleDescriptor) -> anyhow::Result<()> {
        if d.integrity.no_mock_data && self.options.mock_mode {
            bail!("module refuses to load while mock mode is enabled");
        }
        if d.integrity.requires_database {
            let via_dependency = self.graph.dependency_closure(&d.id).iter().any(|dep| {
                self.registry.get(dep).is_some_and(|e| {
                    e.status() != ModuleStatus::Failed
                        && e.descriptor().capabilities.database.is_some()
                })
            });
            if d.capabilities.database.is_none() && !via_dependency {
                bail!("module requires a database, but neither it nor anything it depends on declares one");
            }
        }
        Ok(())
    }

    fn check_dependencies(&self, d: &ModuleDescriptor, staged: &mut Staged) -> anyhow::Result<()> {
        let strict =
            d.dependency_policy.unwrap_or(self.options.dependency_policy) == DependencyPolicy::Strict;

        for dep in &d.dependencies {
            // unknown ids were already reported by the resolver
            let Some(dep_entry) = self.registry.get(dep) else {
                if strict {
                    bail!("required dependency '{dep}' is not registered");
                }
                continue;
            };
            if dep_entry.status() == ModuleStatus::Failed || !dep_entry.is_processed() {
                if strict {
                    bail!("required dependency '{dep}' failed to load");
                }
                tracing::warn!(
                    module = %d.id,
                    depends_on = %dep,
                    "Dependency failed to load; continuing without it"
                );
                continue;
            }
            staged.dependencies.push(dep.clone());
        }
        Ok(())
    }

    fn resolve_injection(&self, d: &ModuleDescriptor, staged: &Staged) -> anyhow::Result<Injected> {
        let closure = self.graph.dependency_closure(&d.id);
        let mut injected = Injected {
            config: None,
            services: BTreeMap::new(),
            databases: Vec::new(),
            ctx: staged.ctx.clone(),
        };

        for target in &d.injects {
            match target {
                InjectTarget::Config => {
                    injected.config = self.config.get_module_config(&d.id).cloned();
                }
                InjectTarget::Service(name) => {
                    match self.container.owner_of(name) {
                        None => bail!("no module provides service '{name}'"),
                        Some(ServiceOwner::Host) => {}
                        Some(ServiceOwner::Module(owner)) => {
                            if !closure.contains(&owner) {
                                bail!(
                                    "service '{name}' is provided by '{owner}', which is not a dependency"
                                );
                            }
                        }
                    }
                    injected
                        .services
                        .insert(name.clone(), ServiceRef::new(name.as_str(), self.container.clone()));
                }
                InjectTarget::Database(name) => {
                    let own = staged.database.as_deref() == Some(name.as_str());
                    let via_dependency = self
                        .wiring
                        .databases
                        .get(name)
                        .is_some_and(|owners| owners.iter().any(|o| closure.contains(o)));
                    if !own && !via_dependency {
                        bail!("database '{name}' is not declared by the module or its dependencies");
                    }
                    injected.databases.push(name.clone());
                }
            }
        }
        Ok(injected)
    }

    /// Step 14: everything fallible first, then the infallible commits.
    fn commit(&mut self, entry: &ModuleEntry, load_index: usize, staged: &mut Staged) -> anyhow::Result<()> {
        let id = entry.id().to_string();
        let instance = staged
            .instance
            .take()
            .ok_or_else(|| anyhow!("instantiate step produced nothing"))?;
        let ModuleInstance {
            core,
            init,
            health,
            stateful,
            services,
        } = instance;

        let router = match staged.router.take() {
            Some((prefix, module_router)) => {
                let base = self.wiring.router.clone();
                let merged = std::panic::catch_unwind(AssertUnwindSafe(|| base.nest(&prefix, module_router)))
                    .map_err(|p| anyhow!("cannot mount api at '{prefix}': {}", panic_message(p.as_ref())))?;
                Some((prefix, merged))
            }
            None => None,
        };

        let mut by_name: HashMap<String, _> = services
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();
        for spec in &staged.services {
            let staged_result = by_name
                .remove(&spec.name)
                .ok_or_else(|| anyhow!("service '{}' has no implementation", spec.name))
                .and_then(|inst| Ok(self.container.stage(&id, spec, inst)?));
            if let Err(e) = staged_result {
                self.container.discard_owner(&id);
                return Err(e);
            }
        }

        // infallible from here on
        if let Some((prefix, merged)) = router {
            self.wiring.router = merged;
            self.wiring.apis.insert(prefix, id.clone());
        }
        if let Some(db) = staged.database.take() {
            self.wiring.databases.entry(db).or_default().insert(id.clone());
        }
        if staged.health {
            if let Some(h) = health {
                self.wiring.health.push((id.clone(), h));
            }
        }
        if let Some(target) = stateful {
            for (kind, priority, timeout) in staged.shutdown.drain(..) {
                let handler = match kind {
                    ShutdownKind::Graceful => {
                        ShutdownHandler::graceful(id.as_str(), target.clone(), priority, timeout)
                    }
                    ShutdownKind::Forced => {
                        ShutdownHandler::forced(id.as_str(), target.clone(), priority, timeout)
                    }
                };
                self.wiring.shutdown.push(handler.with_load_index(load_index));
            }
        }
        let has_hook = match (staged.hook.take(), init) {
            (Some(spec), Some(init)) => {
                let ctx = staged.ctx.clone();
                let hook = spec
                    .depends_on
                    .iter()
                    .fold(
                        PostInitHook::new(spec.hook.as_str(), id.as_str(), move || async move {
                            init.init(&ctx).await
                        }),
                        |h, dep| h.after(dep.as_str()),
                    )
                    .with_priority(spec.priority);
                self.wiring.hooks.push(hook);
                true
            }
            _ => false,
        };

        self.wiring.modules.insert(
            id.clone(),
            WiredModule {
                core,
                stage1_entry: std::mem::take(&mut staged.stage1_entry),
                dependencies: std::mem::take(&mut staged.dependencies),
                has_hook,
            },
        );
        entry.mark_processed();
        Ok(())
    }
}

/// The created instance must match the declared capabilities exactly.
fn verify_instance(d: &ModuleDescriptor, instance: &ModuleInstance) -> anyhow::Result<()> {
    let declared: HashSet<&str> = d.capabilities.services.iter().map(|s| s.name.as_str()).collect();
    let mut provided = HashSet::new();
    for svc in &instance.services {
        if !provided.insert(svc.name()) {
            bail!("instance provides service '{}' twice", svc.name());
        }
        if !declared.contains(svc.name()) {
            bail!("instance provides undeclared service '{}'", svc.name());
        }
    }
    if let Some(missing) = declared.iter().find(|name| !provided.contains(*name)) {
        bail!("declared service '{missing}' has no implementation");
    }
    if d.stage2.is_some() && instance.init.is_none() {
        bail!("a stage-2 hook is declared but the instance has no init implementation");
    }
    if d.capabilities.health_check && instance.health.is_none() {
        bail!("a health check is declared but the instance has no health implementation");
    }
    if d.has_shutdown() && instance.stateful.is_none() {
        bail!("shutdown handlers are declared but the instance has no stop implementation");
    }
    Ok(())
}
