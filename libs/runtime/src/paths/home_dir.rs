//! Resolution of the host's home directory.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum HomeDirError {
    #[error("cannot determine the user home directory")]
    NoUserHome,

    #[error("cannot use home directory {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn user_home() -> Result<PathBuf, HomeDirError> {
    dirs::home_dir().ok_or(HomeDirError::NoUserHome)
}

/// Parent of the default home: `%APPDATA%` on Windows, the user home elsewhere.
fn default_base() -> Result<PathBuf, HomeDirError> {
    if cfg!(windows) {
        dirs::data_dir().ok_or(HomeDirError::NoUserHome)
    } else {
        user_home()
    }
}

fn expand_tilde(raw: &str) -> Result<PathBuf, HomeDirError> {
    if raw == "~" {
        return user_home();
    }
    match raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        Some(rest) => Ok(user_home()?.join(rest)),
        None => Ok(PathBuf::from(raw)),
    }
}

fn absolutize(path: &Path) -> Result<PathBuf, HomeDirError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|source| HomeDirError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Absolute home directory for the host.
///
/// `configured` wins when given (`~` is expanded, relative paths are taken
/// from the working directory); otherwise `<user home>/<default_subdir>`.
pub fn resolve_home_dir(
    configured: Option<String>,
    default_subdir: &str,
    create: bool,
) -> Result<PathBuf, HomeDirError> {
    let path = match configured.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => absolutize(&expand_tilde(raw)?)?,
        _ => default_base()?.join(default_subdir),
    };

    if create {
        std::fs::create_dir_all(&path).map_err(|source| HomeDirError::Io {
            path: path.clone(),
            source,
        })?;
    }
    Ok(path)
}
