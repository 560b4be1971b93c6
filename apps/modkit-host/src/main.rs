use anyhow::Result;
use clap::{Parser, Subcommand};
use modkit::bootstrap::{BootstrapOrchestrator, EnsureDirectories, ProvisionSqliteFile};
use modkit::runtime::{run, RunOptions, ShutdownOptions};
use modkit::{DependencyPolicy, Engine, EngineOptions, ModuleStatus};
use runtime::{AppConfig, CliArgs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod modules;

// Adapter to make AppConfig's module bag implement modkit::ConfigProvider
struct ModkitConfigAdapter(Arc<AppConfig>);

impl modkit::ConfigProvider for ModkitConfigAdapter {
    fn get_module_config(&self, module_id: &str) -> Option<&serde_json::Value> {
        self.0.modules.get(module_id)
    }
}

/// ModKit host - runs the built-in modules through the lifecycle engine
#[derive(Parser)]
#[command(name = "modkit-host")]
#[command(about = "ModKit host - runs modules through the lifecycle engine")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print current configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run in mock mode (modules that refuse mock data will not load)
    #[arg(long)]
    mock: bool,

    /// Treat every declared dependency as required
    #[arg(long)]
    strict: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start all modules and wait for a shutdown signal
    Run,
    /// Resolve the module load order and run registration without starting anything
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        verbose: cli.verbose,
        mock: cli.mock,
        strict: cli.strict,
    };

    // home_dir is normalized and created inside
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    let logging_config = config.logging.clone().unwrap_or_default();
    runtime::init_logging_from_config(&logging_config, &config.home_dir());
    tracing::info!(home_dir = %config.server.home_dir, "ModKit host starting");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_host(config).await,
        Commands::Check => check_config(config),
    }
}

fn engine_options(config: &AppConfig) -> EngineOptions {
    let lc = &config.lifecycle;
    EngineOptions {
        dependency_policy: if lc.strict_dependencies {
            DependencyPolicy::Strict
        } else {
            DependencyPolicy::Lenient
        },
        mock_mode: lc.mock,
        default_shutdown_timeout: lc.shutdown_timeout,
        default_force_timeout: lc.force_timeout,
        ..EngineOptions::default()
    }
}

fn bootstrap(config: &AppConfig) -> Result<BootstrapOrchestrator> {
    let mut orchestrator = BootstrapOrchestrator::new().with_timeout(config.lifecycle.bootstrap_timeout);
    orchestrator.register(EnsureDirectories::new(config.bootstrap_directories()));

    match &config.database {
        Some(db) if config.lifecycle.mock => {
            tracing::info!(url = %db.url, "Mock mode: database file is not provisioned");
        }
        Some(db) => {
            if let Some(handler) = ProvisionSqliteFile::from_dsn(&db.url, &config.home_dir())? {
                tracing::debug!(dsn = %handler.dsn(), "Database file will be provisioned");
                orchestrator.register(handler);
            }
        }
        None => tracing::warn!("No database configuration found"),
    }
    Ok(orchestrator)
}

async fn run_host(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);

    let mut opts = RunOptions::new(Arc::new(ModkitConfigAdapter(config.clone())));
    opts.modules = modules::all();
    opts.bootstrap = bootstrap(&config)?;
    opts.engine = engine_options(&config);
    opts.shutdown = match config.server.timeout_sec {
        0 => ShutdownOptions::Signals,
        secs => {
            tracing::info!(secs, "Host will stop on its own");
            ShutdownOptions::Future(Box::pin(tokio::time::sleep(Duration::from_secs(secs))))
        }
    };
    opts.on_started = Some(Box::new(|report: &modkit::StartupReport| {
        println!(
            "Started: {} ready, {} failed",
            report.ready.len(),
            report.failed.len()
        );
        for (id, failure) in &report.failed {
            println!("  {id}: {failure}");
        }
    }));

    let report = run(opts).await?;
    if !report.all_completed() {
        tracing::warn!("Some shutdown handlers did not complete cleanly");
    }
    println!("Stopped");
    Ok(())
}

fn check_config(config: AppConfig) -> Result<()> {
    tracing::info!("Checking configuration...");
    let options = engine_options(&config);
    let config = Arc::new(config);

    let mut builder = Engine::builder()
        .with_options(options)
        .with_config_provider(Arc::new(ModkitConfigAdapter(config.clone())));
    for factory in modules::all() {
        builder = builder.module_arc(factory);
    }
    let mut engine = builder.build()?;
    let order = engine.prepare()?.to_vec();

    println!("Load order:");
    for (i, id) in order.iter().enumerate() {
        match engine.registry().get(id).and_then(|e| e.failure()) {
            Some(failure) => println!("  {}. {id} (FAILED: {failure})", i + 1),
            None => println!("  {}. {id}", i + 1),
        }
    }

    let failed = order
        .iter()
        .filter(|id| engine.status(id) == Some(ModuleStatus::Failed))
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} module(s) failed registration");
    }
    println!("Configuration check passed");
    Ok(())
}
