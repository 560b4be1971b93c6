//! `core.storage`: in-memory key/value store with an optional JSON snapshot.
//!
//! The snapshot is loaded by the post-init hook and written back on
//! graceful stop. If graceful stop did not get that far, the forced pass
//! writes it synchronously.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use modkit::{
    HealthCheck, InitModule, InjectTarget, Injected, Module, ModuleCtx, ModuleDescriptor,
    ModuleFactory, ModuleInstance, RegisterCtx, ServiceSpec, StatefulModule,
};

pub const MODULE_ID: &str = "core.storage";
pub const KV_SERVICE: &str = "storage.kv";
pub const INIT_HOOK: &str = "core.storage.init";

/// Stops after modules that use it.
const SHUTDOWN_PRIORITY: i32 = 200;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: String);
    fn remove(&self, key: &str) -> Option<String>;
    /// Entries whose key starts with `prefix`, sorted by key.
    fn scan(&self, prefix: &str) -> Vec<(String, String)>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
    dirty: AtomicBool,
}

impl MemoryStore {
    fn load(&self, entries: BTreeMap<String, String>) {
        *self.entries.write() = entries;
        self.dirty.store(false, Ordering::Release);
    }

    fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(&*self.entries.read())
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: &str, value: String) {
        self.entries.write().insert(key.to_string(), value);
        self.dirty.store(true, Ordering::Release);
    }

    fn remove(&self, key: &str) -> Option<String> {
        let removed = self.entries.write().remove(key);
        if removed.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    fn scan(&self, prefix: &str) -> Vec<(String, String)> {
        self.entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

pub struct StorageFactory;

impl ModuleFactory for StorageFactory {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new(MODULE_ID)
            .name("Storage")
            .version(env!("CARGO_PKG_VERSION"))
            .database("main")
            .provides(
                ServiceSpec::new(KV_SERVICE)
                    .with_priority(10)
                    .with_method("get", "read a value by key")
                    .with_method("put", "insert or replace a value")
                    .with_method("remove", "delete a key")
                    .with_method("scan", "list entries under a key prefix"),
            )
            .inject(InjectTarget::Config)
            .health_check()
            .init_hook()
            .graceful_shutdown(SHUTDOWN_PRIORITY, None)
            .forced_shutdown(SHUTDOWN_PRIORITY, None)
    }

    fn create(&self, deps: Injected) -> anyhow::Result<ModuleInstance> {
        let cfg: StorageConfig = deps.config();
        let module = Arc::new(Storage {
            store: Arc::new(MemoryStore::default()),
            snapshot: cfg.snapshot,
        });
        let kv: Arc<dyn KeyValueStore> = module.store.clone();
        Ok(ModuleInstance::new(module.clone())
            .with_init(module.clone())
            .with_health(module.clone())
            .with_stateful(module)
            .with_service(KV_SERVICE, kv))
    }
}

struct Storage {
    store: Arc<MemoryStore>,
    snapshot: Option<PathBuf>,
}

fn snapshot_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|d| !d.as_os_str().is_empty())
}

impl Module for Storage {
    fn register(&self, ctx: &mut RegisterCtx<'_>) -> anyhow::Result<()> {
        // surface a malformed section here instead of silently using defaults
        if ctx.raw_config().is_some() {
            let cfg: StorageConfig = ctx.module_config_required()?;
            tracing::debug!(snapshot = ?cfg.snapshot, "Storage configured");
        }
        ctx.declare_config_schema(serde_json::json!({
            "type": "object",
            "properties": { "snapshot": { "type": "string" } }
        }))
    }
}

#[async_trait]
impl InitModule for Storage {
    async fn init(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        match tokio::fs::read(path).await {
            Ok(raw) => {
                let entries: BTreeMap<String, String> = serde_json::from_slice(&raw)?;
                tracing::info!(path = %path.display(), entries = entries.len(), "Loaded storage snapshot");
                self.store.load(entries);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No storage snapshot yet");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for Storage {
    async fn check(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.snapshot.as_deref().and_then(snapshot_dir) {
            if !dir.is_dir() {
                anyhow::bail!("snapshot directory {} is missing", dir.display());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StatefulModule for Storage {
    async fn stop(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let json = self.store.to_json()?;
        tokio::select! {
            res = tokio::fs::write(path, json) => res?,
            _ = cancel.cancelled() => anyhow::bail!("snapshot write cancelled"),
        }
        self.store.mark_clean();
        tracing::info!(path = %path.display(), "Storage snapshot written");
        Ok(())
    }

    fn force_stop(&self) -> anyhow::Result<()> {
        match &self.snapshot {
            Some(path) if self.store.is_dirty() => {
                std::fs::write(path, self.store.to_json()?)?;
                self.store.mark_clean();
                tracing::warn!(path = %path.display(), "Storage snapshot written during forced stop");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
