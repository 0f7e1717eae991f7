use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;
use walkdir::WalkDir;

/// Name of the per-project tracking directory; never uploaded.
pub const TRACKING_DIR: &str = ".depot";

/// One entry produced by the tree walk.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: PathBuf,
    /// Path relative to the walk root, forward slashes, empty for the
    /// root itself.
    pub rel_path: String,
    pub is_dir: bool,
    pub size: i64,
    pub mtime: DateTime<Utc>,
}

/// Walk a tree on a blocking thread, streaming entries into a bounded
/// channel. Directories are yielded before their contents. The walk ends
/// early when the receiver goes away.
pub fn spawn_tree_walk(root: PathBuf) -> mpsc::Receiver<TreeEntry> {
    let (tx, rx) = mpsc::channel(256);

    tokio::task::spawn_blocking(move || {
        let walk = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != TRACKING_DIR);

        for entry in walk {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable tree entry");
                    continue;
                }
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "skipping entry without metadata");
                    continue;
                }
            };
            if !meta.is_dir() && !meta.is_file() {
                continue;
            }

            let mtime = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let tree_entry = TreeEntry {
                rel_path: slashed_rel_path(&root, entry.path()),
                path: entry.path().to_path_buf(),
                is_dir: meta.is_dir(),
                size: meta.len() as i64,
                mtime,
            };

            if tx.blocking_send(tree_entry).is_err() {
                // Receiver dropped, stop walking.
                return;
            }
        }
    });

    rx
}

/// Relative path of `path` under `root`, forward slashes only.
pub fn slashed_rel_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
