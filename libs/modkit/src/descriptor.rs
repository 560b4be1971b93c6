//! Declarative module descriptors.
//!
//! A descriptor is the immutable, data-only statement of what a module is,
//! what it needs and what it provides. The engine never looks at module code
//! to learn these facts; everything flows from here.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default priority for services, hooks and shutdown handlers.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Entry point name used when a module does not declare one.
pub const DEFAULT_STAGE1_ENTRY: &str = "register";

/// How the engine reacts when a declared dependency is absent or has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Warn and continue without the dependency.
    #[default]
    Lenient,
    /// Fail the dependent module.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodContract {
    pub name: String,
    pub semantics: String,
}

/// A named service a module contributes to the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub priority: i32,
    pub methods: Vec<MethodContract>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            methods: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_method(mut self, name: impl Into<String>, semantics: impl Into<String>) -> Self {
        self.methods.push(MethodContract {
            name: name.into(),
            semantics: semantics.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSurface {
    pub prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub services: Vec<ServiceSpec>,
    pub database: Option<String>,
    pub api: Option<ApiSurface>,
    pub health_check: bool,
}

/// Runtime guarantees a module asks the engine to enforce before it is wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrityPolicy {
    /// Refuse to load while the host runs in mock mode.
    pub no_mock_data: bool,
    /// Refuse to load unless the module (or a dependency) provides a database.
    pub requires_database: bool,
}

/// Something a module receives at instantiation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InjectTarget {
    Config,
    Service(String),
    Database(String),
}

/// Stage-2 (async initialization) hook declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage2Spec {
    pub hook: String,
    pub depends_on: Vec<String>,
    pub priority: i32,
}

impl Stage2Spec {
    pub fn new(hook: impl Into<String>) -> Self {
        Self {
            hook: hook.into(),
            depends_on: Vec::new(),
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn after(mut self, hook: impl Into<String>) -> Self {
        self.depends_on.push(hook.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Shutdown handler declaration. `timeout: None` takes the engine default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSpec {
    pub priority: i32,
    pub timeout: Option<Duration>,
}

impl Default for ShutdownSpec {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            timeout: None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("module id '{0}' is invalid (expected dot-separated [a-z0-9_-] segments)")]
    InvalidId(String),
    #[error("module '{0}' has no name")]
    MissingName(String),
    #[error("module '{module}' has invalid version '{version}' (expected MAJOR.MINOR.PATCH)")]
    InvalidVersion { module: String, version: String },
    /// Only seen when a descriptor is validated on its own; inside the engine
    /// the resolver rejects `a -> a` as a dependency cycle before step 1 runs.
    #[error("module '{0}' depends on itself")]
    SelfDependency(String),
    #[error("module '{module}' declares service '{service}' more than once")]
    DuplicateService { module: String, service: String },
    #[error("module '{0}' declares a service with an empty name")]
    EmptyServiceName(String),
    #[error("module '{module}' declares an empty database name")]
    EmptyDatabase { module: String },
    #[error("module '{module}' has invalid api prefix '{prefix}' (must start with '/' and not end with '/')")]
    InvalidApiPrefix { module: String, prefix: String },
    #[error("module '{module}' declares an empty stage-2 hook name")]
    EmptyHook { module: String },
    #[error("stage-2 hook '{hook}' of module '{module}' depends on itself")]
    HookSelfDependency { module: String, hook: String },
    #[error("module '{module}' declares a zero {kind} shutdown timeout")]
    ZeroTimeout { module: String, kind: &'static str },
    #[error("module '{module}' declares an empty stage-1 entry point")]
    EmptyStage1Entry { module: String },
    #[error("module '{module}' injects service '{service}' that it provides itself")]
    SelfInjection { module: String, service: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub dependencies: BTreeSet<String>,
    pub capabilities: Capabilities,
    pub integrity: IntegrityPolicy,
    /// Overrides the engine-wide policy for this module.
    pub dependency_policy: Option<DependencyPolicy>,
    pub config_schema: Option<serde_json::Value>,
    pub injects: Vec<InjectTarget>,
    pub stage1_entry: String,
    pub stage2: Option<Stage2Spec>,
    pub shutdown: Option<ShutdownSpec>,
    pub force_shutdown: Option<ShutdownSpec>,
}

impl ModuleDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            version: String::new(),
            dependencies: BTreeSet::new(),
            capabilities: Capabilities::default(),
            integrity: IntegrityPolicy::default(),
            dependency_policy: None,
            config_schema: None,
            injects: Vec::new(),
            stage1_entry: DEFAULT_STAGE1_ENTRY.to_string(),
            stage2: None,
            shutdown: None,
            force_shutdown: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn provides(mut self, service: ServiceSpec) -> Self {
        self.capabilities.services.push(service);
        self
    }

    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.capabilities.database = Some(name.into());
        self
    }

    pub fn api(mut self, prefix: impl Into<String>) -> Self {
        self.capabilities.api = Some(ApiSurface {
            prefix: prefix.into(),
        });
        self
    }

    pub fn health_check(mut self) -> Self {
        self.capabilities.health_check = true;
        self
    }

    pub fn integrity(mut self, integrity: IntegrityPolicy) -> Self {
        self.integrity = integrity;
        self
    }

    pub fn policy(mut self, policy: DependencyPolicy) -> Self {
        self.dependency_policy = Some(policy);
        self
    }

    pub fn config_schema(mut self, schema: serde_json::Value) -> Self {
        self.config_schema = Some(schema);
        self
    }

    pub fn inject(mut self, target: InjectTarget) -> Self {
        if !self.injects.contains(&target) {
            self.injects.push(target);
        }
        self
    }

    pub fn stage1_entry(mut self, entry: impl Into<String>) -> Self {
        self.stage1_entry = entry.into();
        self
    }

    pub fn stage2(mut self, spec: Stage2Spec) -> Self {
        self.stage2 = Some(spec);
        self
    }

    /// Declares a stage-2 hook named `<id>.init`.
    pub fn init_hook(self) -> Self {
        let hook = format!("{}.init", self.id);
        self.stage2(Stage2Spec::new(hook))
    }

    pub fn graceful_shutdown(mut self, priority: i32, timeout: Option<Duration>) -> Self {
        self.shutdown = Some(ShutdownSpec { priority, timeout });
        self
    }

    pub fn forced_shutdown(mut self, priority: i32, timeout: Option<Duration>) -> Self {
        self.force_shutdown = Some(ShutdownSpec { priority, timeout });
        self
    }

    pub fn has_stage2(&self) -> bool {
        self.stage2.is_some()
    }

    pub fn has_shutdown(&self) -> bool {
        self.shutdown.is_some() || self.force_shutdown.is_some()
    }

    /// Structural checks that need nothing but the descriptor itself.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let module = || self.id.clone();

        if !is_valid_id(&self.id) {
            return Err(DescriptorError::InvalidId(self.id.clone()));
        }
        if self.name.trim().is_empty() {
            return Err(DescriptorError::MissingName(module()));
        }
        if !is_valid_version(&self.version) {
            return Err(DescriptorError::InvalidVersion {
                module: module(),
                version: self.version.clone(),
            });
        }
        if self.dependencies.contains(&self.id) {
            return Err(DescriptorError::SelfDependency(module()));
        }

        let mut seen = HashSet::new();
        for svc in &self.capabilities.services {
            if svc.name.trim().is_empty() {
                return Err(DescriptorError::EmptyServiceName(module()));
            }
            if !seen.insert(svc.name.as_str()) {
                return Err(DescriptorError::DuplicateService {
                    module: module(),
                    service: svc.name.clone(),
                });
            }
        }
        for target in &self.injects {
            if let InjectTarget::Service(name) = target {
                if seen.contains(name.as_str()) {
                    return Err(DescriptorError::SelfInjection {
                        module: module(),
                        service: name.clone(),
                    });
                }
            }
        }

        if matches!(&self.capabilities.database, Some(db) if db.trim().is_empty()) {
            return Err(DescriptorError::EmptyDatabase { module: module() });
        }
        if let Some(api) = &self.capabilities.api {
            let p = api.prefix.as_str();
            if !p.starts_with('/') || p.len() < 2 || p.ends_with('/') {
                return Err(DescriptorError::InvalidApiPrefix {
                    module: module(),
                    prefix: api.prefix.clone(),
                });
            }
        }

        if self.stage1_entry.trim().is_empty() {
            return Err(DescriptorError::EmptyStage1Entry { module: module() });
        }
        if let Some(stage2) = &self.stage2 {
            if stage2.hook.trim().is_empty() {
                return Err(DescriptorError::EmptyHook { module: module() });
            }
            if stage2.depends_on.contains(&stage2.hook) {
                return Err(DescriptorError::HookSelfDependency {
                    module: module(),
                    hook: stage2.hook.clone(),
                });
            }
        }

        for (kind, spec) in [("graceful", &self.shutdown), ("forced", &self.force_shutdown)] {
            if matches!(spec, Some(ShutdownSpec { timeout: Some(t), .. }) if t.is_zero()) {
                return Err(DescriptorError::ZeroTimeout {
                    module: module(),
                    kind,
                });
            }
        }

        Ok(())
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.split('.').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        })
}

fn is_valid_version(version: &str) -> bool {
    let core = version.split(['-', '+']).next().unwrap_or_default();
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}
