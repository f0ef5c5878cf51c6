//! Root-relative path resolution.
//!
//! Paths received from a peer are joined onto the local root after lexical
//! normalisation. Leading separators are ignored and `..` may not climb
//! above the root. A lookup may land on the root itself; a write target
//! may not.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path {0:?} resolves to the root itself")]
    Empty(String),

    #[error("path {0:?} escapes the root directory")]
    EscapesRoot(String),
}

/// Resolve `relative` under `root` without touching the filesystem.
/// Paths that normalise to nothing resolve to `root`.
pub fn resolve_under(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let parts = normalise(relative)?;
    let mut resolved = root.to_path_buf();
    resolved.extend(parts);
    Ok(resolved)
}

/// Like [`resolve_under`], for paths that will be created or written.
pub fn resolve_target(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let parts = normalise(relative)?;
    if parts.is_empty() {
        return Err(PathError::Empty(relative.to_string()));
    }
    let mut resolved = root.to_path_buf();
    resolved.extend(parts);
    Ok(resolved)
}

fn normalise(relative: &str) -> Result<Vec<&std::ffi::OsStr>, PathError> {
    let mut parts = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(PathError::EscapesRoot(relative.to_string()));
                }
            }
            Component::Normal(part) => parts.push(part),
        }
    }
    Ok(parts)
}
