//! ModKit runtime runner.
//!
//! Full cycle: bootstrap → discover → resolve → register → stage 1 → stage 2
//! → wait → graceful stop → forced stop.
//!
//! Shutdown can be driven by OS signals, an external `CancellationToken`,
//! or an arbitrary future.

use crate::bootstrap::BootstrapOrchestrator;
use crate::context::ConfigProvider;
use crate::contracts::ModuleFactory;
use crate::engine::{Engine, EngineOptions, StartupReport};
use crate::runtime::signals;
use crate::shutdown::ShutdownReport;
use std::{future::Future, pin::Pin, sync::Arc};
use tokio_util::sync::CancellationToken;

/// How the runtime should decide when to stop.
pub enum ShutdownOptions {
    /// Stop on SIGTERM, SIGINT or SIGHUP (console control events on Windows).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// Shutdown starts once this future completes.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

type StartedHook = Box<dyn FnOnce(&StartupReport) + Send>;

/// Everything `run` needs to host a set of modules.
pub struct RunOptions {
    /// Module factories, in discovery order.
    pub modules: Vec<Arc<dyn ModuleFactory>>,
    /// Provider of module config sections (raw JSON by module id).
    pub modules_cfg: Arc<dyn ConfigProvider>,
    /// Environment preparation that must succeed before any module is touched.
    pub bootstrap: BootstrapOrchestrator,
    pub engine: EngineOptions,
    /// Shutdown strategy.
    pub shutdown: ShutdownOptions,
    /// Called once Stage 2 has finished (e.g. to serve the composed router).
    pub on_started: Option<StartedHook>,
}

impl RunOptions {
    pub fn new(modules_cfg: Arc<dyn ConfigProvider>) -> Self {
        Self {
            modules: Vec::new(),
            modules_cfg,
            bootstrap: BootstrapOrchestrator::new(),
            engine: EngineOptions::default(),
            shutdown: ShutdownOptions::Signals,
            on_started: None,
        }
    }
}

/// Runs the host until shutdown is requested. Bootstrap failures, duplicate
/// module ids and dependency cycles are fatal; individual module failures are not.
pub async fn run(opts: RunOptions) -> anyhow::Result<ShutdownReport> {
    let cancel = match &opts.shutdown {
        ShutdownOptions::Token(t) => t.clone(),
        _ => CancellationToken::new(),
    };

    match opts.shutdown {
        ShutdownOptions::Signals => {
            let c = cancel.clone();
            tokio::spawn(async move {
                match signals::wait_for_signal().await {
                    Ok(name) => tracing::info!(signal = name, "Shutdown signal received"),
                    Err(e) => {
                        tracing::warn!(error = %e, "Cannot install signal handlers; waiting for Ctrl+C");
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            tracing::error!(error = %e, "Ctrl+C handler failed");
                        }
                    }
                }
                c.cancel();
            });
        }
        ShutdownOptions::Future(waiter) => {
            let c = cancel.clone();
            tokio::spawn(async move {
                waiter.await;
                tracing::info!("Shutdown future completed");
                c.cancel();
            });
        }
        ShutdownOptions::Token(_) => {
            tracing::debug!("Shutdown is driven by an external token");
        }
    }

    // BOOTSTRAP phase: nothing module-related exists yet.
    opts.bootstrap.run().await?;

    let mut builder = Engine::builder()
        .with_options(opts.engine)
        .with_config_provider(opts.modules_cfg)
        .with_cancellation_token(cancel.clone());
    for factory in opts.modules {
        builder = builder.module_arc(factory);
    }
    let mut engine = builder.build()?;

    // RESOLVE → REGISTER → STAGE 1 → STAGE 2
    let report = engine.start().await?;
    if let Some(on_started) = opts.on_started {
        on_started(&report);
    }

    // WAIT
    cancel.cancelled().await;

    // STOP phase
    Ok(engine.shutdown().await)
}
