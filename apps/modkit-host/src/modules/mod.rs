//! Modules built into the host.

use modkit::ModuleFactory;
use std::sync::Arc;

pub mod settings;
pub mod storage;

/// Every built-in module factory, in discovery order.
pub fn all() -> Vec<Arc<dyn ModuleFactory>> {
    vec![Arc::new(storage::StorageFactory), Arc::new(settings::SettingsFactory)]
}
