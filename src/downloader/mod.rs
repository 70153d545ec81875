use std::path::{Path, PathBuf};

use crate::catalog::Source;

mod executor;
pub mod hasher;
pub mod path;
pub mod transfer;

pub use executor::{Executor, Outcome};

/// One submitted download, immutable for the lifetime of its execution.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub remote_url: String,
    pub relative_path: String,
    pub model_id: String,
    pub source: Source,
    pub storage_root: PathBuf,
}

impl DownloadRequest {
    /// Basename of the destination, used as the event `name`.
    pub fn file_name(&self) -> String {
        Path::new(&self.relative_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.relative_path.clone())
    }
}
