//! # ModKit - Module Lifecycle Engine
//!
//! Discovers modules, orders them by their declared dependencies, runs each
//! through a fixed registration pipeline and then starts them in two stages:
//!
//! - **Stage 1**: synchronous, local registration in load order
//! - **Stage 2**: async initialization through dependency-ordered post-init hooks
//!
//! Shutdown runs a graceful pass followed by a forced pass. A bootstrap phase
//! prepares the environment before any module is touched.
//!
//! ## Example
//!
//! ```rust,ignore
//! use modkit::{Engine, ModuleDescriptor};
//!
//! let mut engine = Engine::builder()
//!     .module(StorageFactory)
//!     .module(SettingsFactory)
//!     .build()?;
//! let report = engine.start().await?;
//! // ...
//! engine.shutdown().await;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod bootstrap;
pub mod container;
pub mod context;
pub mod contracts;
pub mod descriptor;
pub mod engine;
pub mod graph;
pub mod health;
pub mod hooks;
pub mod manifest;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod shutdown;
mod stage;
pub mod status;

pub use bootstrap::{BootstrapHandler, BootstrapOrchestrator};
pub use container::{ContainerError, ServiceContainer, ServiceInstance, ServiceOwner, ServiceRef};
pub use context::{ConfigProvider, ConfigRegistry, ModuleCtx, ModuleCtxBuilder, RegisterCtx, SchemaRegistry};
pub use contracts::*;
pub use descriptor::{
    DependencyPolicy, InjectTarget, IntegrityPolicy, ModuleDescriptor, ServiceSpec, Stage2Spec,
};
pub use engine::{Engine, EngineBuilder, EngineError, EngineOptions, EnginePhase, StartupReport};
pub use health::HealthStatus;
pub use hooks::{HookOutcome, HookReport, HookScheduler, PostInitHook};
pub use pipeline::PipelineStep;
pub use registry::{ModuleRegistry, RegistryError};
pub use resolver::{DependencyResolver, ResolveError};
pub use runtime::{run, RunOptions, ShutdownOptions};
pub use shutdown::{ShutdownOrchestrator, ShutdownReport};
pub use status::{FailurePhase, ModuleFailure, ModuleStatus};
