use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::container::ServiceContainer;

/// Provider of module-specific configuration (raw JSON sections only).
pub trait ConfigProvider: Send + Sync {
    /// Returns raw JSON section for the module, if any.
    fn get_module_config(&self, module_id: &str) -> Option<&serde_json::Value>;
}

impl ConfigProvider for HashMap<String, serde_json::Value> {
    fn get_module_config(&self, module_id: &str) -> Option<&serde_json::Value> {
        self.get(module_id)
    }
}

impl ConfigProvider for BTreeMap<String, serde_json::Value> {
    fn get_module_config(&self, module_id: &str) -> Option<&serde_json::Value> {
        self.get(module_id)
    }
}

/// Collaborator that receives configuration schemas declared by modules.
pub trait ConfigRegistry: Send + Sync {
    fn register_schema(&self, module_id: &str, schema: &serde_json::Value) -> anyhow::Result<()>;
}

/// In-memory [`ConfigRegistry`]; a schema must be a JSON object.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: RwLock<BTreeMap<String, Vec<serde_json::Value>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schemas_for(&self, module_id: &str) -> Vec<serde_json::Value> {
        self.schemas.read().get(module_id).cloned().unwrap_or_default()
    }

    pub fn modules(&self) -> Vec<String> {
        self.schemas.read().keys().cloned().collect()
    }
}

impl ConfigRegistry for SchemaRegistry {
    fn register_schema(&self, module_id: &str, schema: &serde_json::Value) -> anyhow::Result<()> {
        if !schema.is_object() {
            anyhow::bail!("config schema of '{module_id}' must be a JSON object");
        }
        self.schemas
            .write()
            .entry(module_id.to_string())
            .or_default()
            .push(schema.clone());
        Ok(())
    }
}

#[derive(Clone)]
pub struct ModuleCtx {
    pub(crate) config_provider: Option<Arc<dyn ConfigProvider>>,
    pub(crate) services: Arc<ServiceContainer>,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) module_id: Option<Arc<str>>,
    pub(crate) mock_mode: bool,
}

pub struct ModuleCtxBuilder {
    inner: ModuleCtx,
}

impl ModuleCtxBuilder {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            inner: ModuleCtx::from_token(token),
        }
    }
    pub fn with_config_provider(mut self, p: Arc<dyn ConfigProvider>) -> Self {
        self.inner.config_provider = Some(p);
        self
    }
    pub fn with_services(mut self, services: Arc<ServiceContainer>) -> Self {
        self.inner.services = services;
        self
    }
    pub fn with_mock_mode(mut self, mock: bool) -> Self {
        self.inner.mock_mode = mock;
        self
    }
    pub fn build(self) -> ModuleCtx {
        self.inner
    }
}

impl ModuleCtx {
    pub(crate) fn from_token(token: CancellationToken) -> Self {
        Self {
            config_provider: None,
            services: Arc::new(ServiceContainer::default()),
            cancellation_token: token,
            module_id: None,
            mock_mode: false,
        }
    }

    /// Scope context to a specific module (used by the engine).
    pub fn for_module(mut self, id: &str) -> Self {
        self.module_id = Some(Arc::<str>::from(id));
        self
    }

    // ---- public read-only API for modules ----
    pub fn services(&self) -> &Arc<ServiceContainer> {
        &self.services
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn current_module(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    pub fn is_mock(&self) -> bool {
        self.mock_mode
    }

    pub fn raw_config(&self) -> Option<&serde_json::Value> {
        match (&self.module_id, &self.config_provider) {
            (Some(id), Some(p)) => p.get_module_config(id),
            _ => None,
        }
    }

    /// Best-effort: deserialize the module's config into `T`, fallback to `T::default()`
    /// if section is missing or invalid.
    pub fn module_config<T: DeserializeOwned + Default>(&self) -> T {
        self.raw_config()
            .and_then(|v| serde_json::from_value::<T>(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Strict: deserialize the module's config into `T`, returning a pathful error on failure.
    pub fn module_config_required<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let id = self
            .module_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("context is not scoped to a module"))?;

        let prov = self
            .config_provider
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no ConfigProvider"))?;

        let val = prov
            .get_module_config(id)
            .ok_or_else(|| anyhow::anyhow!("missing module config: {id}"))?;

        serde_json::from_value(val.clone()).map_err(|e| anyhow::anyhow!("invalid {id} config: {e}"))
    }
}

/// Context handed to Stage 1. Synchronous and local: the module sees its own
/// configuration section and may declare schemas, nothing else.
pub struct RegisterCtx<'a> {
    module_id: &'a str,
    config: Option<&'a serde_json::Value>,
    schemas: &'a dyn ConfigRegistry,
    declared: usize,
}

impl<'a> RegisterCtx<'a> {
    pub(crate) fn new(
        module_id: &'a str,
        config: Option<&'a serde_json::Value>,
        schemas: &'a dyn ConfigRegistry,
    ) -> Self {
        Self {
            module_id,
            config,
            schemas,
            declared: 0,
        }
    }

    pub fn module_id(&self) -> &str {
        self.module_id
    }

    pub fn raw_config(&self) -> Option<&serde_json::Value> {
        self.config
    }

    pub fn module_config<T: DeserializeOwned + Default>(&self) -> T {
        self.config
            .and_then(|v| serde_json::from_value::<T>(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn module_config_required<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let id = self.module_id;
        let val = self
            .config
            .ok_or_else(|| anyhow::anyhow!("missing module config: {id}"))?;
        serde_json::from_value(val.clone()).map_err(|e| anyhow::anyhow!("invalid {id} config: {e}"))
    }

    /// Declare an additional configuration schema for this module.
    pub fn declare_config_schema(&mut self, schema: serde_json::Value) -> anyhow::Result<()> {
        self.schemas.register_schema(self.module_id, &schema)?;
        self.declared += 1;
        Ok(())
    }

    pub fn declared_schemas(&self) -> usize {
        self.declared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Cfg {
        #[serde(default)]
        port: u16,
    }

    fn provider() -> Arc<dyn ConfigProvider> {
        let mut m = HashMap::new();
        m.insert("core.web".to_string(), json!({ "port": 8080 }));
        m.insert("core.bad".to_string(), json!({ "port": "nope" }));
        Arc::new(m)
    }

    #[test]
    fn module_config_is_scoped() {
        let ctx = ModuleCtxBuilder::new(CancellationToken::new())
            .with_config_provider(provider())
            .build();

        assert_eq!(ctx.module_config::<Cfg>(), Cfg::default());
        let web = ctx.clone().for_module("core.web");
        assert_eq!(web.module_config::<Cfg>().port, 8080);
        assert_eq!(web.current_module(), Some("core.web"));
    }

    #[test]
    fn required_config_reports_errors() {
        let ctx = ModuleCtxBuilder::new(CancellationToken::new())
            .with_config_provider(provider())
            .build();

        let missing = ctx.clone().for_module("core.none").module_config_required::<Cfg>();
        assert!(missing.unwrap_err().to_string().contains("missing module config"));

        let bad = ctx.for_module("core.bad").module_config_required::<Cfg>();
        assert!(bad.unwrap_err().to_string().contains("invalid core.bad config"));
    }

    #[test]
    fn register_ctx_declares_schemas() {
        let schemas = SchemaRegistry::new();
        let cfg = json!({ "port": 1 });
        let mut ctx = RegisterCtx::new("core.web", Some(&cfg), &schemas);

        ctx.declare_config_schema(json!({ "type": "object" })).unwrap();
        assert!(ctx.declare_config_schema(json!("not an object")).is_err());

        assert_eq!(ctx.declared_schemas(), 1);
        assert_eq!(ctx.module_config::<Cfg>().port, 1);
        assert_eq!(schemas.schemas_for("core.web").len(), 1);
    }
}
