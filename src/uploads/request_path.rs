use std::path::{Path, PathBuf};

/// On-disk layout under the storage root.
///
/// Staging blocks live at `<root>/upload/<upload_id>/<block>`; committed
/// content is sharded two levels deep on the file id, so file
/// `f47ac10b-...` lands at `<root>/f4/7a/f47ac10b-...`.
#[derive(Debug, Clone)]
pub struct RequestPath {
    root: PathBuf,
}

impl RequestPath {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RequestPath { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging directory for an in-flight upload.
    pub fn staging_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join("upload").join(upload_id)
    }

    /// Path of one staged block.
    pub fn block_path(&self, upload_id: &str, block: u64) -> PathBuf {
        self.staging_dir(upload_id).join(block.to_string())
    }

    /// Shard directory a committed file belongs in.
    pub fn content_dir(&self, file_id: &str) -> PathBuf {
        if file_id.len() < 4 {
            // Ids are uuids in practice; anything shorter goes unsharded.
            return self.root.clone();
        }
        self.root.join(&file_id[0..2]).join(&file_id[2..4])
    }

    /// Final path of a committed file.
    pub fn content_path(&self, file_id: &str) -> PathBuf {
        self.content_dir(file_id).join(file_id)
    }
}
