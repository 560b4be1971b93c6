//! `core.settings`: string settings persisted in `core.storage`, served over
//! `/settings`.

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use modkit::{
    InitModule, InjectTarget, Injected, Module, ModuleCtx, ModuleDescriptor, ModuleFactory,
    ModuleInstance, RegisterCtx, ServiceContainer, ServiceRef, ServiceSpec, Stage2Spec,
};

use super::storage::{self, KeyValueStore, KV_SERVICE};

pub const MODULE_ID: &str = "core.settings";
pub const SETTINGS_SERVICE: &str = "settings.store";

const KEY_PREFIX: &str = "settings/";

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: String) -> anyhow::Result<()>;
    fn all(&self) -> anyhow::Result<BTreeMap<String, String>>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsConfig {
    /// Seeded by the post-init hook for keys that have no stored value.
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
}

fn validate_key(key: &str) -> anyhow::Result<()> {
    if key.is_empty() || key.contains('/') || key.chars().any(char::is_whitespace) {
        anyhow::bail!("invalid setting key '{key}'");
    }
    Ok(())
}

pub struct SettingsFactory;

impl ModuleFactory for SettingsFactory {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new(MODULE_ID)
            .name("Settings")
            .version(env!("CARGO_PKG_VERSION"))
            .depends_on(storage::MODULE_ID)
            .provides(
                ServiceSpec::new(SETTINGS_SERVICE)
                    .with_method("get", "read one setting")
                    .with_method("set", "store one setting")
                    .with_method("all", "list every setting"),
            )
            .inject(InjectTarget::Service(KV_SERVICE.to_string()))
            .inject(InjectTarget::Config)
            .config_schema(serde_json::json!({
                "type": "object",
                "properties": {
                    "defaults": {
                        "type": "object",
                        "additionalProperties": { "type": "string" }
                    }
                }
            }))
            .api("/settings")
            .stage2(Stage2Spec::new("core.settings.init").after(storage::INIT_HOOK))
    }

    fn register_rest(&self, ctx: &ModuleCtx, router: Router) -> anyhow::Result<Router> {
        let api = Router::new()
            .route("/", get(list_settings))
            .route("/{key}", get(get_setting).put(put_setting))
            .with_state(ctx.services().clone());
        Ok(router.merge(api))
    }

    fn create(&self, deps: Injected) -> anyhow::Result<ModuleInstance> {
        let cfg: SettingsConfig = deps.config();
        let module = Arc::new(Settings {
            kv: deps.service(KV_SERVICE)?,
            defaults: cfg.defaults,
        });
        let store: Arc<dyn SettingsStore> = module.clone();
        Ok(ModuleInstance::new(module.clone())
            .with_init(module)
            .with_service(SETTINGS_SERVICE, store))
    }
}

struct Settings {
    kv: ServiceRef,
    defaults: BTreeMap<String, String>,
}

impl Settings {
    fn kv(&self) -> anyhow::Result<Arc<dyn KeyValueStore>> {
        Ok(self.kv.get::<dyn KeyValueStore>()?)
    }
}

impl SettingsStore for Settings {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        validate_key(key)?;
        Ok(self.kv()?.get(&format!("{KEY_PREFIX}{key}")))
    }

    fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        validate_key(key)?;
        self.kv()?.put(&format!("{KEY_PREFIX}{key}"), value);
        Ok(())
    }

    fn all(&self) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(self
            .kv()?
            .scan(KEY_PREFIX)
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(KEY_PREFIX).map(|k| (k.to_string(), v)))
            .collect())
    }
}

impl Module for Settings {
    fn register(&self, ctx: &mut RegisterCtx<'_>) -> anyhow::Result<()> {
        let cfg: SettingsConfig = ctx.module_config();
        for key in cfg.defaults.keys() {
            validate_key(key)?;
        }
        Ok(())
    }
}

#[async_trait]
impl InitModule for Settings {
    async fn init(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        let kv = self.kv()?;
        let mut seeded = 0;
        for (key, value) in &self.defaults {
            let stored = format!("{KEY_PREFIX}{key}");
            if kv.get(&stored).is_none() {
                kv.put(&stored, value.clone());
                seeded += 1;
            }
        }
        tracing::info!(seeded, "Settings defaults applied");
        Ok(())
    }
}

// -------- HTTP handlers --------

type ApiError = (StatusCode, String);

fn settings(services: &ServiceContainer) -> Result<Arc<dyn SettingsStore>, ApiError> {
    services
        .get::<dyn SettingsStore>(SETTINGS_SERVICE)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

async fn list_settings(
    State(services): State<Arc<ServiceContainer>>,
) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    let all = settings(&services)?
        .all()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;
    Ok(Json(all))
}

async fn get_setting(
    State(services): State<Arc<ServiceContainer>>,
    Path(key): Path<String>,
) -> Result<String, ApiError> {
    settings(&services)?
        .get(&key)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{e:#}")))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("setting '{key}' not found")))
}

async fn put_setting(
    State(services): State<Arc<ServiceContainer>>,
    Path(key): Path<String>,
    body: String,
) -> Result<StatusCode, ApiError> {
    settings(&services)?
        .set(&key, body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{e:#}")))?;
    Ok(StatusCode::NO_CONTENT)
}
