use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::home_dir::resolve_home_dir;

/// Key of the catch-all logging section.
pub const DEFAULT_SECTION: &str = "default";

const DEFAULT_SUBDIR: &str = ".modkit";

/// Host configuration: typed global sections plus a raw per-module bag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    /// Logging sections by target; `None` uses built-in defaults.
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Directory of per-module YAML files (`<module id>.yaml`).
    #[serde(default)]
    pub modules_dir: Option<String>,
    /// module id → raw config section.
    #[serde(default)]
    pub modules: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Normalized to an absolute path on load. Empty means `$HOME/.modkit`.
    #[serde(default)]
    pub home_dir: String,
    /// Stop on its own after this many seconds; 0 runs until signalled.
    #[serde(default)]
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// e.g. "sqlite://data/app.db"; relative SQLite paths live under `home_dir`.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub strict_dependencies: bool,
    #[serde(default)]
    pub mock: bool,
    #[serde(default = "default_bootstrap_timeout", with = "humantime_serde")]
    pub bootstrap_timeout: Duration,
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    #[serde(default = "default_force_timeout", with = "humantime_serde")]
    pub force_timeout: Duration,
    /// Extra directories (relative to `home_dir`) created during bootstrap.
    #[serde(default)]
    pub directories: Vec<String>,
}

fn default_bootstrap_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_force_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            strict_dependencies: false,
            mock: false,
            bootstrap_timeout: default_bootstrap_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            force_timeout: default_force_timeout(),
            directories: Vec::new(),
        }
    }
}

/// Logging configuration: target prefix → settings. Key `default` is the
/// catch-all for targets without their own section.
pub type LoggingConfig = BTreeMap<String, Section>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Section {
    /// "trace" | "debug" | "info" | "warn" | "error" | "off"
    #[serde(default = "default_console_level")]
    pub console_level: String,
    /// Log file, relative to `home_dir`; empty disables file output.
    #[serde(default)]
    pub file: String,
    #[serde(default = "default_file_level")]
    pub file_level: String,
    /// Keep rotated files for this many days (takes precedence over `max_backups`).
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

fn default_console_level() -> String {
    "info".to_string()
}

fn default_file_level() -> String {
    "debug".to_string()
}

pub fn default_logging_config() -> LoggingConfig {
    let mut logging = BTreeMap::new();
    logging.insert(
        DEFAULT_SECTION.to_string(),
        Section {
            console_level: default_console_level(),
            file: "logs/modkit.log".to_string(),
            file_level: default_file_level(),
            max_age_days: None,
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: None,
            logging: Some(default_logging_config()),
            lifecycle: LifecycleConfig::default(),
            modules_dir: None,
            modules: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// defaults → YAML file → `APP__`-prefixed environment variables.
    /// Normalizes and creates `server.home_dir`.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let path = config_path.as_ref();
        if !path.is_file() {
            bail!("config file {} does not exist", path.display());
        }

        // optional sections stay None unless YAML/ENV provide them
        let base = AppConfig {
            logging: None,
            ..AppConfig::default()
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(path))
            // APP__LIFECYCLE__SHUTDOWN_TIMEOUT=5s maps to lifecycle.shutdown_timeout
            .merge(Env::prefixed("APP__").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;

        config.normalize_home_dir()?;

        if let Some(dir) = config.modules_dir.clone() {
            merge_module_files(&mut config.modules, dir)?;
        }
        Ok(config)
    }

    /// Loads `config_path` when given, built-in defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut c = Self::default();
                c.normalize_home_dir()?;
                Ok(c)
            }
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if args.mock {
            self.lifecycle.mock = true;
        }
        if args.strict {
            self.lifecycle.strict_dependencies = true;
        }

        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut(DEFAULT_SECTION) {
            match args.verbose {
                0 => {}
                1 => default_section.console_level = "debug".to_string(),
                _ => default_section.console_level = "trace".to_string(),
            }
        }
    }

    pub fn home_dir(&self) -> PathBuf {
        PathBuf::from(&self.server.home_dir)
    }

    /// `lifecycle.directories` resolved against `home_dir`, home itself first.
    pub fn bootstrap_directories(&self) -> Vec<PathBuf> {
        let home = self.home_dir();
        let mut dirs = vec![home.clone()];
        dirs.extend(self.lifecycle.directories.iter().map(|d| {
            let p = Path::new(d);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                home.join(p)
            }
        }));
        dirs
    }

    fn normalize_home_dir(&mut self) -> Result<()> {
        let configured = Some(self.server.home_dir.clone());
        let resolved = resolve_home_dir(configured, DEFAULT_SUBDIR, true)
            .context("Failed to resolve server.home_dir")?;
        self.server.home_dir = resolved.to_string_lossy().to_string();
        Ok(())
    }
}

/// Command line switches that override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub verbose: u8,
    pub mock: bool,
    pub strict: bool,
}

fn merge_module_files(
    bag: &mut BTreeMap<String, serde_json::Value>,
    dir: impl AsRef<Path>,
) -> Result<()> {
    use std::fs;
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext != "yml" && ext != "yaml" {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("cannot read module config {}", path.display()))?;
        let val: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid module config {}", path.display()))?;
        // files win over inline sections of the same module
        bag.insert(name.to_string(), serde_json::to_value(val)?);
    }
    Ok(())
}
