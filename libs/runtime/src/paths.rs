use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Sub-directory of the user's home used when no `home_dir` is configured.
pub const DEFAULT_HOME_SUBDIR: &str = ".modhost";

#[derive(Debug, thiserror::Error)]
pub enum HomeDirError {
    #[error("neither HOME nor USERPROFILE is set")]
    HomeMissing,
    #[error("home_dir must be absolute after ~ expansion: {0}")]
    AbsoluteRequired(String),
    #[error("failed to create home_dir '{path}': {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn user_home() -> Result<PathBuf, HomeDirError> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .ok_or(HomeDirError::HomeMissing)
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(raw: &str) -> Result<PathBuf, HomeDirError> {
    if raw == "~" {
        return user_home();
    }
    match raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        Some(rest) => Ok(user_home()?.join(rest)),
        None => Ok(PathBuf::from(raw)),
    }
}

/// Resolve the process home directory.
///
/// An explicit value gets `~` expanded and must then be absolute; otherwise
/// `<user home>/<default_subdir>` is used. With `create`, the directory is made.
pub fn resolve_home_dir(
    configured: Option<&str>,
    default_subdir: &str,
    create: bool,
) -> Result<PathBuf, HomeDirError> {
    let path = match configured.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => {
            let p = expand_tilde(raw)?;
            if !p.is_absolute() {
                return Err(HomeDirError::AbsoluteRequired(raw.to_string()));
            }
            p
        }
        None => user_home()?.join(default_subdir),
    };

    if create {
        fs::create_dir_all(&path).map_err(|source| HomeDirError::Create {
            path: path.clone(),
            source,
        })?;
    }
    Ok(path)
}

/// Absolute paths are kept; relative ones are joined onto `base`.
pub fn resolve_against(raw: &str, base: &Path) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}
