//! Host runtime support: layered configuration and logging setup.

pub mod config;
pub mod logging;
pub mod paths;

pub use config::{AppConfig, CliArgs, LifecycleConfig, LoggingConfig, Section};
pub use logging::init_logging_from_config;
