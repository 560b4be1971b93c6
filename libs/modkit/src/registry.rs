//! Catalogue of discovered modules.
//!
//! The registry owns every discovered descriptor (after manifest merging) and
//! the lifecycle status of its module. It does not decide order; that is the
//! resolver's job.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::context::ConfigProvider;
use crate::contracts::ModuleFactory;
use crate::descriptor::ModuleDescriptor;
use crate::manifest::ModuleManifest;
use crate::status::{FailurePhase, InvalidTransition, ModuleFailure, ModuleStatus, StatusCell};

pub struct ModuleEntry {
    descriptor: ModuleDescriptor,
    factory: Arc<dyn ModuleFactory>,
    discovery_index: usize,
    status: StatusCell,
    processed: AtomicBool,
    failure: Mutex<Option<ModuleFailure>>,
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("id", &self.descriptor.id)
            .field("deps", &self.descriptor.dependencies)
            .field("status", &self.status.get())
            .field("processed", &self.is_processed())
            .finish()
    }
}

impl ModuleEntry {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub(crate) fn factory(&self) -> &Arc<dyn ModuleFactory> {
        &self.factory
    }

    pub fn discovery_index(&self) -> usize {
        self.discovery_index
    }

    pub fn status(&self) -> ModuleStatus {
        self.status.get()
    }

    pub fn failure(&self) -> Option<ModuleFailure> {
        self.failure.lock().clone()
    }

    /// Passed all registration steps.
    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_processed(&self) {
        self.processed.store(true, Ordering::Release);
    }

    pub(crate) fn transition(&self, to: ModuleStatus) -> Result<ModuleStatus, InvalidTransition> {
        self.status.transition(to)
    }

    /// Records the first failure and moves the module to `Failed`.
    pub(crate) fn fail(&self, phase: FailurePhase, reason: impl Into<String>) {
        let failure = ModuleFailure::new(phase, reason);
        tracing::error!(module = %self.id(), phase = %failure.phase, reason = %failure.reason, "Module failed");
        if self.status.transition(ModuleStatus::Failed).is_ok() {
            let mut slot = self.failure.lock();
            if slot.is_none() {
                *slot = Some(failure);
            }
        }
    }
}

pub struct ModuleRegistry {
    entries: Vec<ModuleEntry>, // discovery order
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.entries.iter().map(|e| e.id()).collect();
        f.debug_struct("ModuleRegistry").field("modules", &ids).finish()
    }
}

impl ModuleRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn entries(&self) -> &[ModuleEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&ModuleEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn status(&self, id: &str) -> Option<ModuleStatus> {
        self.get(id).map(ModuleEntry::status)
    }

    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        self.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failed(&self) -> Vec<(String, ModuleFailure)> {
        self.entries
            .iter()
            .filter_map(|e| e.failure().map(|f| (e.id().to_string(), f)))
            .collect()
    }
}

/// Collects factories; uniqueness of module ids is enforced at build time.
#[derive(Default)]
pub struct RegistryBuilder {
    factories: Vec<Arc<dyn ModuleFactory>>,
}

impl RegistryBuilder {
    pub fn register<F: ModuleFactory>(&mut self, factory: F) -> &mut Self {
        self.factories.push(Arc::new(factory));
        self
    }

    pub fn register_arc(&mut self, factory: Arc<dyn ModuleFactory>) -> &mut Self {
        self.factories.push(factory);
        self
    }

    /// Collect descriptors, fill gaps from config manifests, reject duplicate ids.
    pub fn build(self, config: &dyn ConfigProvider) -> Result<ModuleRegistry, RegistryError> {
        let mut entries = Vec::with_capacity(self.factories.len());
        let mut index = HashMap::new();
        let mut errors = Vec::new();

        for factory in self.factories {
            let mut descriptor = factory.descriptor();

            if let Some(section) = config.get_module_config(&descriptor.id) {
                match ModuleManifest::from_config(section) {
                    Ok(Some(manifest)) => {
                        manifest.apply_to(&mut descriptor);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(
                        module = %descriptor.id,
                        error = %e,
                        "Ignoring malformed config manifest"
                    ),
                }
            }

            if index.contains_key(&descriptor.id) {
                errors.push(format!("Module '{}' is already registered", descriptor.id));
                continue;
            }

            let discovery_index = entries.len();
            index.insert(descriptor.id.clone(), discovery_index);
            entries.push(ModuleEntry {
                descriptor,
                factory,
                discovery_index,
                status: StatusCell::default(),
                processed: AtomicBool::new(false),
                failure: Mutex::new(None),
            });
        }

        if !errors.is_empty() {
            return Err(RegistryError::InvalidRegistryConfiguration { errors });
        }

        tracing::info!(
            modules = ?entries.iter().map(|e: &ModuleEntry| e.id().to_string()).collect::<Vec<_>>(),
            "Modules discovered"
        );
        Ok(ModuleRegistry { entries, index })
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registry configuration:\n{errors:#?}")]
    InvalidRegistryConfiguration { errors: Vec<String> },
}
