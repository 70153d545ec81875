use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::DownloadError;

/// Resolve `relative` against `storage_root` and guarantee the result stays
/// inside the (canonical) root.
///
/// `..` segments and absolute paths are refused outright. The remaining path
/// is canonicalized as far as it exists on disk, so a symlink anywhere in the
/// existing prefix is followed before the containment check runs. Components
/// that do not exist yet cannot be symlinks and are appended as-is.
pub fn resolve(relative: &str, storage_root: &Path) -> Result<PathBuf, DownloadError> {
    let requested = Path::new(relative);
    if requested
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(DownloadError::PathTraversal(requested.to_path_buf()));
    }

    let root = storage_root.canonicalize()?;
    let resolved = canonicalize_existing_prefix(&root.join(requested))?;

    if !resolved.starts_with(&root) {
        return Err(DownloadError::PathTraversal(requested.to_path_buf()));
    }
    Ok(resolved)
}

fn canonicalize_existing_prefix(path: &Path) -> io::Result<PathBuf> {
    let mut missing = Vec::new();
    let mut existing = path;
    // symlink_metadata so that a dangling link is still treated as existing
    // and then rejected by canonicalize instead of being appended blindly.
    while existing.symlink_metadata().is_err() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no existing ancestor for {}", path.display()),
                ));
            }
        }
    }

    let mut resolved = existing.canonicalize()?;
    for name in missing.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}
