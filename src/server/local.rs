use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One directory under the storage root and the files directly inside it.
#[derive(Debug, Serialize, PartialEq)]
pub struct DirNode {
    pub id: String,
    pub name: String,
    pub children: Vec<FileNode>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct FileNode {
    pub id: String,
    pub name: String,
    /// Size in MiB.
    pub size: f64,
}

/// Space taken under the storage root, in GiB, bucketed by whether the
/// containing directory names a catalog.
#[derive(Debug, Serialize, Default, PartialEq)]
pub struct DiskUsage {
    pub civitai: f64,
    pub huggingface: f64,
    pub other: f64,
}

/// Flat list of every directory under `root` (root included), each with its
/// files. A missing root yields an empty list.
pub fn model_tree(root: &Path) -> Vec<DirNode> {
    let mut nodes: Vec<DirNode> = Vec::new();
    let mut index: HashMap<std::path::PathBuf, usize> = HashMap::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping unreadable entry under {}: {}", root.display(), err);
                continue;
            }
        };
        let path = entry.path();

        if entry.file_type().is_dir() {
            index.insert(path.to_path_buf(), nodes.len());
            nodes.push(DirNode {
                id: path.display().to_string(),
                name: file_name(path),
                children: Vec::new(),
            });
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!("cannot stat {}: {}", path.display(), err);
                continue;
            }
        };
        let parent = path.parent().and_then(|p| index.get(p)).copied();
        if let Some(i) = parent {
            nodes[i].children.push(FileNode {
                id: path.display().to_string(),
                name: file_name(path),
                size: size as f64 / MIB,
            });
        }
    }
    nodes
}

/// Only the part of a file's directory below `root` decides its bucket.
pub fn disk_usage(root: &Path) -> DiskUsage {
    let mut usage = DiskUsage::default();

    for entry in WalkDir::new(root).follow_links(false).into_iter() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let size = match entry.metadata() {
            Ok(meta) => meta.len() as f64 / GIB,
            Err(_) => continue,
        };

        let dir = entry
            .path()
            .parent()
            .and_then(|p| p.strip_prefix(root).ok())
            .map(|p| p.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if dir.contains("civitai") {
            usage.civitai += size;
        } else if dir.contains("huggingface") {
            usage.huggingface += size;
        } else {
            usage.other += size;
        }
    }
    usage
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
