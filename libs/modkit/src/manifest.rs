//! Deprecated config-side module manifests.
//!
//! Older deployments describe modules in their configuration section:
//!
//! ```yaml
//! modules:
//!   core.settings:
//!     manifest:
//!       name: Settings
//!       version: 0.3.0
//!       dependencies: [core.storage]
//!       services: [settings.store]
//! ```
//!
//! Descriptor fields always win. A manifest only fills what the descriptor
//! leaves empty, and every use logs a deprecation warning.

use serde::Deserialize;

use crate::descriptor::{ModuleDescriptor, ServiceSpec};

pub const MANIFEST_KEY: &str = "manifest";

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModuleManifest {
    pub name: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

impl ModuleManifest {
    /// Reads `manifest` from a module's config section, if present.
    pub fn from_config(section: &serde_json::Value) -> Result<Option<Self>, serde_json::Error> {
        match section.get(MANIFEST_KEY) {
            None => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone()).map(Some),
        }
    }

    /// Fills empty descriptor fields; returns the names of fields taken from the manifest.
    pub fn apply_to(&self, descriptor: &mut ModuleDescriptor) -> Vec<&'static str> {
        let mut used = Vec::new();

        if descriptor.name.is_empty() {
            if let Some(name) = &self.name {
                descriptor.name = name.clone();
                used.push("name");
            }
        }
        if descriptor.version.is_empty() {
            if let Some(version) = &self.version {
                descriptor.version = version.clone();
                used.push("version");
            }
        }
        if descriptor.dependencies.is_empty() && !self.dependencies.is_empty() {
            descriptor.dependencies = self.dependencies.iter().cloned().collect();
            used.push("dependencies");
        }
        if descriptor.capabilities.services.is_empty() && !self.services.is_empty() {
            descriptor.capabilities.services =
                self.services.iter().map(ServiceSpec::new).collect();
            used.push("services");
        }

        for field in &used {
            tracing::warn!(
                module = %descriptor.id,
                field = %field,
                "Module field taken from deprecated config manifest; declare it in the descriptor"
            );
        }
        used
    }
}
