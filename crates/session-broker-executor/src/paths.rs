//! Path resolution against a session's working directory.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

/// Symlink hops followed before giving up, matching the usual OS limit.
const MAX_LINK_HOPS: usize = 40;

/// Expand a leading `~` to the user's home directory.
#[must_use]
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Join `path` onto `cwd` after expanding `~`. Components are kept as
/// given, so `..` after a symlink still means the target's parent once the
/// OS resolves it.
#[must_use]
pub fn join(cwd: &Path, path: &str) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    }
}

/// Resolve `path` against `cwd`, expanding `~` and normalizing `.`/`..`
/// lexically. Used for paths that may not exist yet.
#[must_use]
pub fn resolve(cwd: &Path, path: &str) -> PathBuf {
    normalize(&join(cwd, path))
}

/// The file a write to `path` should replace.
///
/// Existing paths are canonicalized. A dangling symlink is followed hop by
/// hop to the missing file it names. Anything else is returned unchanged.
///
/// # Errors
/// Returns error if a link cannot be read or the chain is too long.
pub async fn follow_links(path: &Path) -> io::Result<PathBuf> {
    if let Ok(real) = tokio::fs::canonicalize(path).await {
        return Ok(real);
    }

    let mut current = path.to_path_buf();
    for _ in 0..MAX_LINK_HOPS {
        match tokio::fs::symlink_metadata(&current).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                let target = tokio::fs::read_link(&current).await?;
                current = match current.parent() {
                    Some(parent) if target.is_relative() => parent.join(target),
                    _ => target,
                };
            }
            _ => return Ok(current),
        }
    }
    Err(io::Error::other(format!(
        "too many levels of symbolic links at {}",
        path.display()
    )))
}

/// Lexically remove `.` and `..` components.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut components: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match components.last() {
                Some(Component::Normal(_)) => {
                    components.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => components.push(Component::ParentDir),
            },
            other => components.push(other),
        }
    }
    components.iter().collect()
}
