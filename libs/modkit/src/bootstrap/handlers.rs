use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::BootstrapHandler;

/// Creates missing directories (home dir, data dirs, log dirs).
#[derive(Debug, Clone)]
pub struct EnsureDirectories {
    dirs: Vec<PathBuf>,
}

impl EnsureDirectories {
    pub const PRIORITY: i32 = 10;

    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }

    fn missing(&self) -> impl Iterator<Item = &PathBuf> {
        self.dirs.iter().filter(|d| !d.is_dir())
    }
}

#[async_trait]
impl BootstrapHandler for EnsureDirectories {
    fn name(&self) -> &str {
        "ensure-directories"
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn should_run(&self) -> bool {
        self.missing().next().is_some()
    }

    async fn execute(&self) -> Result<bool> {
        for dir in self.missing() {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow!("cannot create directory {}: {e}", dir.display()))?;
            tracing::info!(path = %dir.display(), "Created directory");
        }
        Ok(self.dirs.iter().all(|d| d.is_dir()))
    }
}

/// Makes sure the SQLite file behind a `sqlite://` DSN exists.
#[derive(Debug, Clone)]
pub struct ProvisionSqliteFile {
    path: PathBuf,
    query: Option<String>,
}

impl ProvisionSqliteFile {
    pub const PRIORITY: i32 = 20;

    /// `Ok(None)` for in-memory and non-SQLite DSNs. Relative paths are
    /// resolved against `base_dir`; percent-encoded paths are decoded.
    pub fn from_dsn(dsn: &str, base_dir: &Path) -> Result<Option<Self>> {
        if is_memory_dsn(dsn) {
            return Ok(None);
        }
        let url = match url::Url::parse(dsn) {
            Ok(url) if url.scheme() == "sqlite" => url,
            Ok(_) => return Ok(None),
            Err(e) if dsn.starts_with("sqlite:") => {
                return Err(anyhow!("invalid SQLite DSN '{dsn}': {e}"))
            }
            Err(_) => return Ok(None),
        };

        // `sqlite://data/app.db` puts the first segment in the authority
        let raw = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
        let decoded = urlencoding::decode(&raw)
            .map_err(|e| anyhow!("invalid SQLite path in DSN '{dsn}': {e}"))?;
        if decoded.is_empty() || decoded == "/" {
            return Err(anyhow!("Empty SQLite path in DSN"));
        }

        let mut path = PathBuf::from(decoded.as_ref());
        if path.is_relative() {
            path = base_dir.join(path);
        }
        Ok(Some(Self {
            path,
            query: url.query().map(str::to_owned),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The DSN rewritten with an absolute, forward-slash path.
    pub fn dsn(&self) -> String {
        let mut out = String::from("sqlite://");
        out.push_str(&self.path.to_string_lossy().replace('\\', "/"));
        if let Some(q) = &self.query {
            out.push('?');
            out.push_str(q);
        }
        out
    }
}

/// `sqlite::memory:`, `sqlite://memory:`, `sqlite://:memory:` and any DSN
/// with a `mode=memory` query never touch the filesystem.
fn is_memory_dsn(dsn: &str) -> bool {
    const MEMORY_FORMS: [&str; 3] = ["sqlite::memory:", "sqlite://memory:", "sqlite://:memory:"];
    if MEMORY_FORMS.iter().any(|m| dsn.eq_ignore_ascii_case(m)) {
        return true;
    }
    url::Url::parse(dsn).is_ok_and(|url| {
        url.query_pairs()
            .any(|(k, v)| k.eq_ignore_ascii_case("mode") && v.eq_ignore_ascii_case("memory"))
    })
}

#[async_trait]
impl BootstrapHandler for ProvisionSqliteFile {
    fn name(&self) -> &str {
        "provision-sqlite-file"
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn should_run(&self) -> bool {
        !self.path.is_file()
    }

    async fn execute(&self) -> Result<bool> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| anyhow!("cannot create database file {}: {e}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), "Provisioned SQLite database file");
        Ok(self.path.is_file())
    }
}
